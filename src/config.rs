use std::time::Duration;

use crate::common::Node;

/// Default timeout for dialing an outbound connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(16);
/// Default timeout for the handshake exchange.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(8);
/// Default time a connection waits for a reply before closing.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(8);
/// Default time a query waits for its connection.
pub const DEFAULT_QUERY_CONNECT_TIMEOUT: Duration = Duration::from_secs(8);
/// Default time a query waits for its reply.
pub const DEFAULT_QUERY_RESPONSE_TIMEOUT: Duration = Duration::from_secs(8);

pub const DEFAULT_TX_QUEUE_CAPACITY: usize = 128;
pub const DEFAULT_WAIT_RESPONSE_CAPACITY: usize = 32;
/// 1 MiB.
pub const DEFAULT_MAX_PACKAGE_SIZE: usize = 1024 * 1024;

pub const DEFAULT_TIMER_TICK: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_NEAREST: usize = 8;

#[derive(Debug, Clone)]
/// Connection and query configurations
pub struct Config {
    /// This node, advertised in handshakes and as `from` in messages.
    ///
    /// Defaults to a random id on the loopback interface, port 0.
    pub local: Node,
    /// Serve routing only, refusing value and provider messages.
    ///
    /// Defaults to false
    pub bootstrap_only: bool,
    /// Defaults to [DEFAULT_CONNECT_TIMEOUT]
    pub connect_timeout: Duration,
    /// Read and write timeout applied to the socket while handshaking.
    ///
    /// Defaults to [DEFAULT_HANDSHAKE_TIMEOUT]
    pub handshake_timeout: Duration,
    /// How long a sent request waits in the wait-response set.
    ///
    /// Expiry closes the whole connection, so keep it longer than the round trip
    /// to the slowest peer you care about.
    ///
    /// Defaults to [DEFAULT_RESPONSE_TIMEOUT]
    pub response_timeout: Duration,
    /// Defaults to [DEFAULT_QUERY_CONNECT_TIMEOUT]
    pub query_connect_timeout: Duration,
    /// Defaults to [DEFAULT_QUERY_RESPONSE_TIMEOUT]
    pub query_response_timeout: Duration,
    /// Packages waiting to be written, further packages are discarded.
    ///
    /// Defaults to [DEFAULT_TX_QUEUE_CAPACITY]
    pub tx_queue_capacity: usize,
    /// Outstanding requests per connection, further requests are discarded.
    ///
    /// Defaults to [DEFAULT_WAIT_RESPONSE_CAPACITY]
    pub wait_response_capacity: usize,
    /// Largest accepted frame.
    ///
    /// Defaults to [DEFAULT_MAX_PACKAGE_SIZE]
    pub max_package_size: usize,
    /// Resolution of the timer service.
    ///
    /// Defaults to [DEFAULT_TIMER_TICK]
    pub timer_tick: Duration,
    /// Nodes returned in answer to a find-node request.
    ///
    /// Defaults to [DEFAULT_MAX_NEAREST]
    pub max_nearest: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local: Node::random_local(0),
            bootstrap_only: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            query_connect_timeout: DEFAULT_QUERY_CONNECT_TIMEOUT,
            query_response_timeout: DEFAULT_QUERY_RESPONSE_TIMEOUT,
            tx_queue_capacity: DEFAULT_TX_QUEUE_CAPACITY,
            wait_response_capacity: DEFAULT_WAIT_RESPONSE_CAPACITY,
            max_package_size: DEFAULT_MAX_PACKAGE_SIZE,
            timer_tick: DEFAULT_TIMER_TICK,
            max_nearest: DEFAULT_MAX_NEAREST,
        }
    }
}
