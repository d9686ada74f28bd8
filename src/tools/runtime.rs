//! Blocking bridge for the object store SDKs.
//!
//! The engine is synchronous; only the S3 and Azure SDKs require an async
//! runtime. A single shared runtime is created on first use and every driver
//! call blocks on it, so no engine code ever runs concurrently.

use std::future::Future;

use lazy_static::lazy_static;
use tokio::runtime::Runtime;

lazy_static! {
    static ref RUNTIME: Runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("unable to create tokio runtime");
}

pub fn block_on<F: Future>(future: F) -> F::Output {
    RUNTIME.block_on(future)
}
