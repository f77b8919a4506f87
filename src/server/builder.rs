use crate::{
    common::http::{HttpClient, HyperHttpClient},
    server::{
        callback::{CallbackChannel, CallbackLoader, InMemoryCallbackLoader},
        dispatch::{PlaceholderTemplateEngine, TemplateEngine},
        handler::MockdHandler,
        state::{CoreConfig, MockCore},
        MockServer, MockServerConfig,
    },
};
use std::{sync::Arc, time::Duration};

/// Configures and wires a mock server: network settings, core sizing and the
/// collaborators the dispatcher runs with. Every knob has a default, so
/// `MockdServerBuilder::new().build()` yields a working server.
pub struct MockdServerBuilder {
    port: Option<u16>,
    expose: Option<bool>,
    log_capacity: Option<usize>,
    max_expectations: Option<usize>,
    forward_timeout: Option<Duration>,
    callback_timeout: Option<Duration>,
    http_client: Option<Arc<dyn HttpClient + Send + Sync + 'static>>,
    template_engine: Option<Arc<dyn TemplateEngine>>,
    callback_loader: Option<Arc<dyn CallbackLoader>>,
    callback_channel: Option<Arc<dyn CallbackChannel>>,
}

impl Default for MockdServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MockdServerBuilder {
    pub fn new() -> Self {
        MockdServerBuilder {
            port: None,
            expose: None,
            log_capacity: None,
            max_expectations: None,
            forward_timeout: None,
            callback_timeout: None,
            http_client: None,
            template_engine: None,
            callback_loader: None,
            callback_channel: None,
        }
    }

    /// Sets the port to bind. Without it an ephemeral port is chosen.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn port_option(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    /// Binds to all interfaces instead of loopback only.
    pub fn expose(mut self, expose: bool) -> Self {
        self.expose = Some(expose);
        self
    }

    pub fn expose_option(mut self, expose: Option<bool>) -> Self {
        self.expose = expose;
        self
    }

    /// Caps the number of retained log entries. Oldest entries are evicted first.
    pub fn log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = Some(capacity);
        self
    }

    /// Caps the number of concurrently active expectations.
    pub fn max_expectations(mut self, limit: usize) -> Self {
        self.max_expectations = Some(limit);
        self
    }

    /// Sets how long a forwarded upstream call may take before the dispatcher
    /// gives up on it.
    pub fn forward_timeout(mut self, timeout: Duration) -> Self {
        self.forward_timeout = Some(timeout);
        self
    }

    /// Sets how long the dispatcher waits for a remote callback reply.
    pub fn callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = Some(timeout);
        self
    }

    pub fn with_http_client(mut self, client: Arc<dyn HttpClient + Send + Sync + 'static>) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn with_template_engine(mut self, engine: Arc<dyn TemplateEngine>) -> Self {
        self.template_engine = Some(engine);
        self
    }

    pub fn with_callback_loader(mut self, loader: Arc<dyn CallbackLoader>) -> Self {
        self.callback_loader = Some(loader);
        self
    }

    pub fn with_callback_channel(mut self, channel: Arc<dyn CallbackChannel>) -> Self {
        self.callback_channel = Some(channel);
        self
    }

    /// Builds just the matching core, without a network front. Useful for tests
    /// and embedded use.
    pub fn build_core(self) -> MockCore {
        let defaults = CoreConfig::default();
        let config = CoreConfig {
            log_capacity: self.log_capacity.unwrap_or(defaults.log_capacity),
            max_expectations: self.max_expectations.unwrap_or(defaults.max_expectations),
            forward_timeout: self.forward_timeout.unwrap_or(defaults.forward_timeout),
            callback_timeout: self.callback_timeout.unwrap_or(defaults.callback_timeout),
        };

        MockCore::new(
            config,
            self.http_client
                .unwrap_or_else(|| Arc::new(HyperHttpClient::new())),
            self.template_engine
                .unwrap_or_else(|| Arc::new(PlaceholderTemplateEngine::new())),
            self.callback_loader
                .unwrap_or_else(|| Arc::new(InMemoryCallbackLoader::new())),
            self.callback_channel,
        )
    }

    /// Builds the full server around a fresh core.
    pub fn build(self) -> MockServer<MockdHandler> {
        let config = MockServerConfig {
            static_port: self.port,
            expose: self.expose.unwrap_or(false),
        };

        let core = Arc::new(
            Self {
                port: None,
                expose: None,
                ..self
            }
            .build_core(),
        );

        MockServer::new(Box::new(MockdHandler::new(core)), config)
    }

    /// Builds the full server around an existing core, e.g. one shared with
    /// in-process test code that registers callbacks on it.
    pub fn build_with_core(self, core: Arc<MockCore>) -> MockServer<MockdHandler> {
        let config = MockServerConfig {
            static_port: self.port,
            expose: self.expose.unwrap_or(false),
        };

        MockServer::new(Box::new(MockdHandler::new(core)), config)
    }
}
