#[cfg(feature = "browser")]
pub mod browser_fetcher;
pub mod extractor;
pub mod fetcher;

#[cfg(feature = "browser")]
pub use browser_fetcher::BrowserTransport;
pub use extractor::PageExtractor;
pub use fetcher::ReqwestTransport;
