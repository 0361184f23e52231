//! Name-to-component registry.
//!
//! Requests reference their callbacks and errbacks by name; the middleware
//! order maps in the settings reference plug-ins by name. This registry is
//! the table those names resolve against. It is built explicitly and handed
//! to the engine at construction; there is no process-global state.
//!
//! [`Registry::with_builtins`] pre-registers the built-in middleware,
//! pipeline and extension constructors; user components are added on top.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::CrawlError;
use crate::extension::Extension;
use crate::middleware::{DownloaderMiddleware, ItemPipeline, SpiderMiddleware};
use crate::request::Request;
use crate::response::Response;
use crate::settings::Settings;
use crate::spider::ResultStream;
use crate::stats::Stats;

/// Parses a response into follow-up requests and items.
pub type CallbackFn = Arc<dyn Fn(Response) -> ResultStream + Send + Sync>;

/// Handles a failed request; may produce follow-up yields.
pub type ErrbackFn =
    Arc<dyn Fn(Request, Option<Response>, CrawlError) -> Option<ResultStream> + Send + Sync>;

pub type DownloaderMwCtor =
    Arc<dyn Fn(&Settings, Arc<Stats>) -> Arc<dyn DownloaderMiddleware> + Send + Sync>;
pub type SpiderMwCtor =
    Arc<dyn Fn(&Settings, Arc<Stats>) -> Arc<dyn SpiderMiddleware> + Send + Sync>;
pub type PipelineCtor =
    Arc<dyn Fn(&Settings, Arc<Stats>) -> Arc<dyn ItemPipeline> + Send + Sync>;
pub type ExtensionCtor = Arc<dyn Fn(&Settings, Arc<Stats>) -> Arc<dyn Extension> + Send + Sync>;

#[derive(Default)]
pub struct Registry {
    callbacks: HashMap<String, CallbackFn>,
    errbacks: HashMap<String, ErrbackFn>,
    downloader_middlewares: HashMap<String, DownloaderMwCtor>,
    spider_middlewares: HashMap<String, SpiderMwCtor>,
    item_pipelines: HashMap<String, PipelineCtor>,
    extensions: HashMap<String, ExtensionCtor>,
}

impl Registry {
    /// An empty registry. Only useful for tests that wire everything by
    /// hand; crawls want [`Registry::with_builtins`].
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in middleware, pipeline and extension
    /// registered under the names the default order maps use.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::middleware::downloader::register_builtins(&mut registry);
        crate::middleware::spider::register_builtins(&mut registry);
        crate::extension::register_builtins(&mut registry);
        registry
    }

    pub fn register_callback<F>(&mut self, name: &str, callback: F) -> Result<(), CrawlError>
    where
        F: Fn(Response) -> ResultStream + Send + Sync + 'static,
    {
        insert_unique(&mut self.callbacks, name, Arc::new(callback), "callback")
    }

    pub fn register_errback<F>(&mut self, name: &str, errback: F) -> Result<(), CrawlError>
    where
        F: Fn(Request, Option<Response>, CrawlError) -> Option<ResultStream>
            + Send
            + Sync
            + 'static,
    {
        insert_unique(&mut self.errbacks, name, Arc::new(errback), "errback")
    }

    pub fn register_downloader_middleware<F>(
        &mut self,
        name: &str,
        ctor: F,
    ) -> Result<(), CrawlError>
    where
        F: Fn(&Settings, Arc<Stats>) -> Arc<dyn DownloaderMiddleware> + Send + Sync + 'static,
    {
        insert_unique(
            &mut self.downloader_middlewares,
            name,
            Arc::new(ctor),
            "downloader middleware",
        )
    }

    pub fn register_spider_middleware<F>(&mut self, name: &str, ctor: F) -> Result<(), CrawlError>
    where
        F: Fn(&Settings, Arc<Stats>) -> Arc<dyn SpiderMiddleware> + Send + Sync + 'static,
    {
        insert_unique(
            &mut self.spider_middlewares,
            name,
            Arc::new(ctor),
            "spider middleware",
        )
    }

    pub fn register_item_pipeline<F>(&mut self, name: &str, ctor: F) -> Result<(), CrawlError>
    where
        F: Fn(&Settings, Arc<Stats>) -> Arc<dyn ItemPipeline> + Send + Sync + 'static,
    {
        insert_unique(&mut self.item_pipelines, name, Arc::new(ctor), "item pipeline")
    }

    pub fn register_extension<F>(&mut self, name: &str, ctor: F) -> Result<(), CrawlError>
    where
        F: Fn(&Settings, Arc<Stats>) -> Arc<dyn Extension> + Send + Sync + 'static,
    {
        insert_unique(&mut self.extensions, name, Arc::new(ctor), "extension")
    }

    pub fn callback(&self, name: &str) -> Option<CallbackFn> {
        self.callbacks.get(name).cloned()
    }

    pub fn errback(&self, name: &str) -> Option<ErrbackFn> {
        self.errbacks.get(name).cloned()
    }

    pub fn downloader_middleware(&self, name: &str) -> Option<DownloaderMwCtor> {
        self.downloader_middlewares.get(name).cloned()
    }

    pub fn spider_middleware(&self, name: &str) -> Option<SpiderMwCtor> {
        self.spider_middlewares.get(name).cloned()
    }

    pub fn item_pipeline(&self, name: &str) -> Option<PipelineCtor> {
        self.item_pipelines.get(name).cloned()
    }

    pub fn extension(&self, name: &str) -> Option<ExtensionCtor> {
        self.extensions.get(name).cloned()
    }
}

fn insert_unique<V>(
    map: &mut HashMap<String, V>,
    name: &str,
    value: V,
    what: &str,
) -> Result<(), CrawlError> {
    if name.is_empty() {
        return Err(CrawlError::Config(format!("{what} name cannot be empty")));
    }
    if map.contains_key(name) {
        return Err(CrawlError::Config(format!(
            "{what} {name:?} is already registered"
        )));
    }
    map.insert(name.to_string(), value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spider::no_results;

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = Registry::new();
        registry
            .register_callback("parse", |_| no_results())
            .unwrap();
        assert!(registry.register_callback("parse", |_| no_results()).is_err());
        assert!(registry.register_callback("", |_| no_results()).is_err());
        assert!(registry.callback("parse").is_some());
        assert!(registry.callback("missing").is_none());
    }

    #[test]
    fn builtins_cover_the_default_order_maps() {
        let registry = Registry::with_builtins();
        let settings = Settings::with_defaults();
        for (name, _) in settings.get_merged_order_map("DOWNLOADER_MIDDLEWARES") {
            assert!(
                registry.downloader_middleware(&name).is_some(),
                "missing downloader middleware {name}"
            );
        }
        for (name, _) in settings.get_merged_order_map("SPIDER_MIDDLEWARES") {
            assert!(
                registry.spider_middleware(&name).is_some(),
                "missing spider middleware {name}"
            );
        }
        for (name, _) in settings.get_merged_order_map("EXTENSIONS") {
            assert!(
                registry.extension(&name).is_some(),
                "missing extension {name}"
            );
        }
    }
}
