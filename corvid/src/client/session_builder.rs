//! SessionBuilder provides an easy way to create new Sessions

use super::session::{Session, SessionConfig};
use crate::authentication::{AuthenticatorProvider, PlainTextAuthenticator};
use crate::errors::NewSessionError;
use crate::network::PoolConfig;
use crate::policies::host_listener::HostListener;
use crate::policies::load_balancing::LoadBalancingPolicy;
use crate::policies::reconnection::ReconnectionPolicy;
use crate::policies::retry::RetryPolicy;
use crate::statement::Consistency;

use corvid_cql::frame::Compression;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// SessionBuilder is used to create new Session instances
/// # Example
///
/// ```
/// # use corvid::client::session::Session;
/// # use corvid::client::session_builder::SessionBuilder;
/// # use corvid::client::Compression;
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let session: Session = SessionBuilder::new()
///     .known_node("127.0.0.1:9042")
///     .compression(Some(Compression::Snappy))
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct SessionBuilder {
    pub config: SessionConfig,
}

impl SessionBuilder {
    /// Creates new SessionBuilder with default configuration
    /// # Default configuration
    /// * Compression: None
    ///
    pub fn new() -> Self {
        SessionBuilder {
            config: SessionConfig::new(),
        }
    }

    /// Add a known node with a hostname
    /// # Examples
    /// ```
    /// # use corvid::client::session::Session;
    /// # use corvid::client::session_builder::SessionBuilder;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let session: Session = SessionBuilder::new()
    ///     .known_node("127.0.0.1:9042")
    ///     .build()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn known_node(mut self, hostname: impl AsRef<str>) -> Self {
        self.config.add_known_node(hostname);
        self
    }

    /// Add a known node with an IP address
    pub fn known_node_addr(mut self, node_addr: SocketAddr) -> Self {
        self.config.add_known_node_addr(node_addr);
        self
    }

    /// Add a list of known nodes with hostnames
    pub fn known_nodes(mut self, hostnames: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        self.config.add_known_nodes(hostnames);
        self
    }

    /// Add a list of known nodes with IP addresses
    pub fn known_nodes_addr(mut self, node_addrs: impl IntoIterator<Item = SocketAddr>) -> Self {
        for addr in node_addrs {
            self.config.add_known_node_addr(addr);
        }
        self
    }

    /// Set username and password for plain text authentication.\
    /// If the database server will require authentication\
    ///
    /// # Example
    /// ```
    /// # use corvid::client::session::Session;
    /// # use corvid::client::session_builder::SessionBuilder;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let session: Session = SessionBuilder::new()
    ///     .known_node("127.0.0.1:9042")
    ///     .user("cassandra", "cassandra")
    ///     .build()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn user(mut self, username: impl Into<String>, passwd: impl Into<String>) -> Self {
        self.config.authenticator = Some(Arc::new(PlainTextAuthenticator::new(username, passwd)));
        self
    }

    /// Set custom authenticator provider to create an authenticator instance during a session creation.
    pub fn authenticator_provider(
        mut self,
        authenticator_provider: Arc<dyn AuthenticatorProvider>,
    ) -> Self {
        self.config.authenticator = Some(authenticator_provider);
        self
    }

    /// Set preferred Compression algorithm.
    /// The default is no compression.
    /// If it is not supported by database server Session will fall back to no compression.
    pub fn compression(mut self, compression: Option<Compression>) -> Self {
        self.config.compression = compression;
        self
    }

    /// Set the load balancing policy. The default is token-aware round robin.
    pub fn load_balancing(mut self, policy: Arc<dyn LoadBalancingPolicy>) -> Self {
        self.config.load_balancing = policy;
        self
    }

    /// Set the retry policy used by statements that do not set their own.
    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.config.retry_policy = policy;
        self
    }

    /// Set the backoff of reconnecting to nodes.
    pub fn reconnection_policy(mut self, policy: Arc<dyn ReconnectionPolicy>) -> Self {
        self.config.reconnection_policy = policy;
        self
    }

    /// Sets the per-distance sizing of the connection pools.
    pub fn pool_config(mut self, pool_config: PoolConfig) -> Self {
        self.config.pool_config = pool_config;
        self
    }

    /// Changes connection timeout
    /// The default is 5 seconds.
    /// If it's higher than underlying os's default connection timeout it won't effect.
    pub fn connection_timeout(mut self, duration: Duration) -> Self {
        self.config.connect_timeout = duration;
        self
    }

    /// Bounds every execution, retries included. `None` disables the bound.
    /// The default is 30 seconds.
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Sets the consistency of statements that do not set their own.
    pub fn default_consistency(mut self, consistency: Consistency) -> Self {
        self.config.default_consistency = consistency;
        self
    }

    /// Set the keepalive interval.
    /// The default is 30 seconds. `None` disables keepalives.
    pub fn keepalive_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    /// Set how long a connection may leave a keepalive unanswered before
    /// it is closed.
    pub fn keepalive_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.keepalive_timeout = timeout;
        self
    }

    /// Set the nodelay TCP flag.
    /// The default is true.
    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.config.tcp_nodelay = nodelay;
        self
    }

    /// Set the TCP keepalive interval. The default is `None`, which
    /// leaves TCP keepalive off.
    pub fn tcp_keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.tcp_keepalive_interval = Some(interval);
        self
    }

    /// Registers a listener for node events. May be called many times.
    pub fn host_listener(mut self, listener: Arc<dyn HostListener>) -> Self {
        self.config.host_listeners.push(listener);
        self
    }

    /// Set keyspace to be used on all connections.\
    /// Each connection will send `"USE <keyspace_name>"` before sending any requests.\
    /// This can be later changed with [`Session::use_keyspace`]
    pub fn use_keyspace(mut self, keyspace_name: impl Into<String>, case_sensitive: bool) -> Self {
        self.config.used_keyspace = Some(keyspace_name.into());
        self.config.keyspace_case_sensitive = case_sensitive;
        self
    }

    /// Set the delay between schema agreement checks.
    /// The default is 200ms.
    pub fn schema_agreement_interval(mut self, interval: Duration) -> Self {
        self.config.schema_agreement_interval = interval;
        self
    }

    /// Set the schema agreement timeout.
    /// The default is 60 seconds.
    pub fn schema_agreement_timeout(mut self, timeout: Duration) -> Self {
        self.config.schema_agreement_timeout = timeout;
        self
    }

    /// Whether statements that change the schema wait for schema agreement.
    /// The default is true.
    pub fn auto_await_schema_agreement(mut self, enabled: bool) -> Self {
        self.config.auto_await_schema_agreement = enabled;
        self
    }

    /// Set the interval of periodic metadata refresh.
    /// The default is 60 seconds.
    pub fn cluster_metadata_refresh_interval(mut self, interval: Duration) -> Self {
        self.config.cluster_metadata_refresh_interval = interval;
        self
    }

    /// Builds the Session after setting all the options.
    ///
    /// Fails if no known node can be resolved or reached.
    pub async fn build(&self) -> Result<Session, NewSessionError> {
        Session::connect(self.config.clone()).await
    }
}
