//! External stack lifecycle: the [`StackFactory`] collaborator from
//! `spec.md` §4.5, the [`ExternalStack`] handle it hands back, and the
//! atomic [`UsageCounter`] that keeps a stack alive exactly as long as any
//! listener or connection still references it (`spec.md` §4.1).
//!
//! We don't have access to the original's virtual network stack library
//! (`ioth`), so a "stack" here is modeled as ownership of one host network
//! interface: sockets created "on" a stack are bound to that interface via
//! `SO_BINDTODEVICE`, and "destroying" the stack means removing the
//! address the rotator assigned to it. See `DESIGN.md` for the rationale.

use crate::config::ExtStackConfig;
use anyhow::{Context, Result};
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A freshly created per-epoch external stack: one interface, one assigned
/// address (once [`StackFactory::add_ipv6_address`] has run).
#[derive(Debug, Clone)]
pub struct ExternalStack {
    pub iface: String,
    pub iface_index: u32,
    pub address: Option<Ipv6Addr>,
    /// Whether sockets bound "on" this stack should `SO_BINDTODEVICE` to
    /// `iface`. `true` for a real interface (`LinuxNetlinkStackFactory`);
    /// `false` for [`NullStackFactory`], whose loopback-bound test sockets
    /// would otherwise need `CAP_NET_RAW` they don't have.
    pub bind_to_device: bool,
}

/// The long-lived stack used to reach backend services. Shared across all
/// epochs; the factory must tolerate concurrent use (`spec.md` §5).
#[derive(Debug, Clone, Default)]
pub struct InternalStack {
    pub iface: Option<String>,
}

/// The narrow interface the core depends on to create/destroy per-epoch
/// stacks and configure their address. Exact signatures are
/// implementation-defined (`spec.md` §4.5); this is ours.
pub trait StackFactory: Send + Sync {
    /// Creates a new external stack bound to the configured interface.
    fn create_external_stack(&self, cfg: &ExtStackConfig) -> Result<ExternalStack>;

    /// Destroys a previously created external stack. Called exactly once,
    /// on the usage counter's 1→0 transition.
    fn destroy_external_stack(&self, stack: ExternalStack);

    /// Assigns `addr/prefix_len` to the stack's interface.
    fn add_ipv6_address(&self, stack: &ExternalStack, addr: Ipv6Addr, prefix_len: u8) -> Result<()>;

    /// Brings the stack's interface (link) up.
    fn set_link_up(&self, stack: &ExternalStack) -> Result<()>;
}

struct CounterInner {
    count: AtomicUsize,
    stack: Mutex<Option<ExternalStack>>,
    factory: Arc<dyn StackFactory>,
}

/// An atomic refcount bound to exactly one [`ExternalStack`] (`spec.md`
/// §4.1). Every long-lived task that touches the stack holds one
/// increment; the stack is torn down on the transition to zero, and only
/// then.
#[derive(Clone)]
pub struct UsageCounter(Arc<CounterInner>);

impl UsageCounter {
    /// Creates a counter bound to `stack`, initialised to zero. The caller
    /// is expected to `acquire()` immediately for its own reference
    /// (`spec.md` §4.2 step 2).
    pub fn new(stack: ExternalStack, factory: Arc<dyn StackFactory>) -> Self {
        Self(Arc::new(CounterInner {
            count: AtomicUsize::new(0),
            stack: Mutex::new(Some(stack)),
            factory,
        }))
    }

    /// Atomic increment. Must precede any use of the embedded stack by a
    /// new task.
    pub fn acquire(&self) {
        self.0.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Atomic decrement. If the new value is zero, destroys the stack
    /// through the factory and frees the counter's hold on it. The caller
    /// must not touch the stack after calling this.
    pub fn release(&self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(stack) = self.0.stack.lock().unwrap_or_else(|e| e.into_inner()).take() {
                self.0.factory.destroy_external_stack(stack);
            }
        }
    }

    /// Reads the current count. Only useful for tests/diagnostics — the
    /// value can change concurrently from any other task.
    pub fn count(&self) -> usize {
        self.0.count.load(Ordering::Acquire)
    }

    /// Runs `f` with a reference to the stack, as long as it hasn't been
    /// torn down yet. Returns `None` once the stack has been destroyed.
    pub fn with_stack<R>(&self, f: impl FnOnce(&ExternalStack) -> R) -> Option<R> {
        let guard = self.0.stack.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().map(f)
    }

    /// Records that `addr` has been assigned to the bound stack, so a later
    /// teardown knows which address to remove. No-op once the stack has
    /// already been destroyed.
    pub fn set_address(&self, addr: Ipv6Addr) {
        let mut guard = self.0.stack.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(stack) = guard.as_mut() {
            stack.address = Some(addr);
        }
    }
}

/// Production [`StackFactory`]: configures a real Linux interface via
/// `rtnetlink`, the same approach `firezone-bin-shared`'s
/// `tun_device_manager` uses for TUN devices. Owns a dedicated
/// single-threaded Tokio runtime purely to drive that one async
/// dependency — callers (the rotator) invoke it synchronously.
pub struct LinuxNetlinkStackFactory {
    runtime: tokio::runtime::Runtime,
}

impl LinuxNetlinkStackFactory {
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to create netlink runtime")?;
        Ok(Self { runtime })
    }

    async fn interface_index(handle: &rtnetlink::Handle, iface: &str) -> Result<u32> {
        use futures::TryStreamExt;

        let mut links = handle.link().get().match_name(iface.to_string()).execute();
        let link = links
            .try_next()
            .await
            .context("netlink link lookup failed")?
            .with_context(|| format!("no such interface: {iface}"))?;
        Ok(link.header.index)
    }
}

impl StackFactory for LinuxNetlinkStackFactory {
    fn create_external_stack(&self, cfg: &ExtStackConfig) -> Result<ExternalStack> {
        let iface = cfg.iface.clone();
        let index = self.runtime.block_on(async {
            let (connection, handle, _) = rtnetlink::new_connection()?;
            tokio::spawn(connection);
            Self::interface_index(&handle, &iface).await
        })?;

        Ok(ExternalStack {
            iface,
            iface_index: index,
            address: None,
            bind_to_device: true,
        })
    }

    fn destroy_external_stack(&self, stack: ExternalStack) {
        let Some(address) = stack.address else {
            return;
        };
        let index = stack.iface_index;
        let target = std::net::IpAddr::V6(address);

        let result = self.runtime.block_on(async move {
            use futures::TryStreamExt;
            use netlink_packet_route::address::AddressAttribute;

            let (connection, handle, _) = rtnetlink::new_connection()?;
            tokio::spawn(connection);

            let mut addrs = handle
                .address()
                .get()
                .set_link_index_filter(index)
                .execute();

            while let Some(msg) = addrs.try_next().await.context("netlink address list failed")? {
                let matches_target = msg
                    .attributes
                    .iter()
                    .any(|attr| matches!(attr, AddressAttribute::Address(a) if *a == target));
                if matches_target {
                    handle
                        .address()
                        .del(msg)
                        .execute()
                        .await
                        .context("netlink address del failed")?;
                }
            }
            anyhow::Ok(())
        });

        if let Err(e) = result {
            tracing::warn!(iface = %stack.iface, error = %e, "failed to tear down external stack address");
        }
    }

    fn add_ipv6_address(&self, stack: &ExternalStack, addr: Ipv6Addr, prefix_len: u8) -> Result<()> {
        let index = stack.iface_index;
        self.runtime.block_on(async move {
            let (connection, handle, _) = rtnetlink::new_connection()?;
            tokio::spawn(connection);
            handle
                .address()
                .add(index, std::net::IpAddr::V6(addr), prefix_len)
                .execute()
                .await
                .context("netlink address add failed")
        })
    }

    fn set_link_up(&self, stack: &ExternalStack) -> Result<()> {
        let index = stack.iface_index;
        self.runtime.block_on(async move {
            let (connection, handle, _) = rtnetlink::new_connection()?;
            tokio::spawn(connection);
            handle
                .link()
                .set(index)
                .up()
                .execute()
                .await
                .context("netlink link set up failed")
        })
    }
}

/// Test/dev [`StackFactory`]: every epoch reuses the loopback interface and
/// never actually touches the network configuration. Its stacks come back
/// with `bind_to_device: false`, so listen/bind sockets skip
/// `SO_BINDTODEVICE` too — letting the TCP/UDP relay engines be exercised
/// end-to-end on loopback without `CAP_NET_ADMIN`/`CAP_NET_RAW`.
pub struct NullStackFactory {
    pub iface_index: u32,
}

impl Default for NullStackFactory {
    fn default() -> Self {
        Self { iface_index: 1 }
    }
}

impl StackFactory for NullStackFactory {
    fn create_external_stack(&self, cfg: &ExtStackConfig) -> Result<ExternalStack> {
        Ok(ExternalStack {
            iface: cfg.iface.clone(),
            iface_index: self.iface_index,
            address: None,
            bind_to_device: false,
        })
    }

    fn destroy_external_stack(&self, _stack: ExternalStack) {}

    fn add_ipv6_address(&self, _stack: &ExternalStack, _addr: Ipv6Addr, _prefix_len: u8) -> Result<()> {
        Ok(())
    }

    fn set_link_up(&self, _stack: &ExternalStack) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingFactory(Arc<AtomicUsize>);
    impl StackFactory for CountingFactory {
        fn create_external_stack(&self, cfg: &ExtStackConfig) -> Result<ExternalStack> {
            Ok(ExternalStack {
                iface: cfg.iface.clone(),
                iface_index: 1,
                address: None,
                bind_to_device: false,
            })
        }
        fn destroy_external_stack(&self, _stack: ExternalStack) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        fn add_ipv6_address(&self, _stack: &ExternalStack, _addr: Ipv6Addr, _prefix_len: u8) -> Result<()> {
            Ok(())
        }
        fn set_link_up(&self, _stack: &ExternalStack) -> Result<()> {
            Ok(())
        }
    }

    fn stack() -> ExternalStack {
        ExternalStack {
            iface: "otip0".to_string(),
            iface_index: 1,
            address: Some("2001:db8::1".parse().unwrap()),
            bind_to_device: false,
        }
    }

    #[test]
    fn destroyed_exactly_once_when_balanced() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let counter = UsageCounter::new(stack(), Arc::new(CountingFactory(destroyed.clone())));

        counter.acquire();
        counter.acquire();
        counter.acquire();
        assert_eq!(counter.count(), 3);

        counter.release();
        counter.release();
        assert_eq!(destroyed.load(Ordering::SeqCst), 0);

        counter.release();
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stack_unreachable_after_teardown() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let counter = UsageCounter::new(stack(), Arc::new(CountingFactory(destroyed)));

        counter.acquire();
        counter.release();

        assert!(counter.with_stack(|_| ()).is_none());
    }

    #[test]
    fn concurrent_acquire_release_tears_down_once() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let counter = UsageCounter::new(stack(), Arc::new(CountingFactory(destroyed.clone())));
        counter.acquire(); // rotator's own reference, held until the end

        let handles: Vec<_> = (0..64)
            .map(|_| {
                let c = counter.clone();
                c.acquire();
                std::thread::spawn(move || {
                    c.with_stack(|s| s.iface.clone());
                    c.release();
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(destroyed.load(Ordering::SeqCst), 0);

        counter.release();
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }
}
