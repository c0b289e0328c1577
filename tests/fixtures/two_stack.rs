//! Two stacks joined by an in-memory overlay link
//!
//! # Example
//!
//! ```no_run
//! use meshstack_integration_tests::fixtures::TwoStackFixture;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let fixture = TwoStackFixture::new().unwrap();
//!     let listener = fixture.stack_a.listen_tcp(fixture.endpoint_a(9000)).unwrap();
//!     // ... dial from fixture.stack_b ...
//!     fixture.cleanup().await;
//! }
//! ```

use meshstack_core::{LoopbackEngine, PublicKey};
use meshstack_netstack::{NetStack, NicId, StackConfig, StackError};
use std::future::Future;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tracing::debug;

/// MTU used unless a test asks for another
pub const DEFAULT_MTU: usize = 1500;

/// Two stacks, A and B, over a loopback engine pair
pub struct TwoStackFixture {
    /// Engine backing stack A
    pub engine_a: LoopbackEngine,
    /// Engine backing stack B
    pub engine_b: LoopbackEngine,
    /// Stack on nic1
    pub stack_a: NetStack,
    /// Stack on nic2
    pub stack_b: NetStack,
}

impl TwoStackFixture {
    /// Fixture with random keys, MTU 1500 and default stack settings
    ///
    /// # Errors
    ///
    /// Returns the stack construction error, e.g. when called outside a
    /// Tokio runtime.
    pub fn new() -> Result<Self, StackError> {
        Self::with_config(DEFAULT_MTU, StackConfig::default())
    }

    /// Fixture with a custom MTU and configuration shared by both stacks
    ///
    /// Stack B gets the next NIC id after the configured one.
    ///
    /// # Errors
    ///
    /// Returns the stack construction error.
    pub fn with_config(mtu: usize, config: StackConfig) -> Result<Self, StackError> {
        let (key_a, key_b) = distinct_keys();
        let (engine_a, engine_b) = LoopbackEngine::pair(key_a, key_b, mtu);

        let stack_a = NetStack::new(&engine_a, config.clone())?;
        let config_b = StackConfig {
            nic_id: NicId(config.nic_id.0 + 1),
            ..config
        };
        let stack_b = NetStack::new(&engine_b, config_b)?;

        debug!(a = %stack_a.local_addr(), b = %stack_b.local_addr(), mtu, "two-stack fixture up");
        Ok(Self {
            engine_a,
            engine_b,
            stack_a,
            stack_b,
        })
    }

    /// Overlay address of stack A
    #[must_use]
    pub fn addr_a(&self) -> Ipv6Addr {
        self.stack_a.local_addr()
    }

    /// Overlay address of stack B
    #[must_use]
    pub fn addr_b(&self) -> Ipv6Addr {
        self.stack_b.local_addr()
    }

    /// Socket address on stack A
    #[must_use]
    pub fn endpoint_a(&self, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V6(self.addr_a()), port)
    }

    /// `[addr]:port` string for stack A, as accepted by `dial_context`
    #[must_use]
    pub fn endpoint_a_string(&self, port: u16) -> String {
        self.endpoint_a(port).to_string()
    }

    /// Close both stacks
    pub async fn cleanup(self) {
        self.stack_b.close().await;
        self.stack_a.close().await;
    }
}

fn distinct_keys() -> (PublicKey, PublicKey) {
    let a: [u8; 32] = rand::random();
    let mut b: [u8; 32] = rand::random();
    // Differing first bytes keep the derived addresses apart.
    b[0] = !a[0];
    (PublicKey::from_bytes(a), PublicKey::from_bytes(b))
}

/// Run `fut` under a generous timeout so a hang fails the test instead of
/// stalling the suite.
///
/// # Panics
///
/// Panics if `fut` does not finish within five seconds.
pub async fn wait_for<F: Future>(what: &str, fut: F) -> F::Output {
    match tokio::time::timeout(Duration::from_secs(5), fut).await {
        Ok(output) => output,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}
