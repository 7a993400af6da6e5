//! Scripted fetcher for unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::FetchError;
use crate::network::Fetcher;
use crate::request::{Request, Response};

#[derive(Clone)]
pub enum Reply {
    Respond(Response),
    /// Transport failure
    Fail,
    /// Never resolves
    Hang,
    /// Resolves once the notify fires
    Gated(Arc<Notify>, Response),
}

#[derive(Default)]
pub struct MockFetcher {
    replies: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<Request>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, url: &str, reply: Reply) {
        self.replies
            .lock()
            .expect("replies lock")
            .insert(url.to_string(), reply);
    }

    pub fn respond(&self, url: &str, status: u16, body: &str) {
        self.reply(url, Reply::Respond(Response::new(status, body)));
    }

    pub fn fail(&self, url: &str) {
        self.reply(url, Reply::Fail);
    }

    pub fn calls(&self) -> Vec<Request> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
        self.calls.lock().expect("calls lock").push(request.clone());
        let reply = self
            .replies
            .lock()
            .expect("replies lock")
            .get(request.url.as_str())
            .cloned()
            .unwrap_or(Reply::Fail);

        match reply {
            Reply::Respond(response) => Ok(response),
            Reply::Fail => Err(FetchError::Offline(request.url.to_string())),
            Reply::Hang => futures::future::pending().await,
            Reply::Gated(notify, response) => {
                notify.notified().await;
                Ok(response)
            }
        }
    }
}
