//! Network access for the router and the lifecycle manager.
//!
//! A fetch only fails on transport errors. Any status the server answers
//! with, 404 and 500 included, resolves to a `Response`.

pub mod http;

use async_trait::async_trait;

use crate::error::FetchError;
use crate::request::{Request, Response};

pub use http::HttpFetcher;

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// A fetcher for which the network is never reachable.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineFetcher;

#[async_trait]
impl Fetcher for OfflineFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
        Err(FetchError::Offline(request.url.to_string()))
    }
}
