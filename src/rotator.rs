//! The epoch rotator (`spec.md` §4.2): the main-thread loop that notices a
//! new OTIP epoch, stands up its external stack and address, and spawns
//! the TCP/UDP engines against it. Epochs can legitimately overlap — a new
//! epoch's preactive window opens before the previous epoch's postactive
//! window closes — so standing up epoch N+1 never waits on epoch N's
//! listeners to finish; each epoch's [`UsageCounter`] tracks its own stack
//! independently.

use crate::config::Config;
use crate::oracle::{current_epoch, derive_address, epoch_fingerprint, Epoch, EpochWindow};
use crate::stack::{StackFactory, UsageCounter};
use crate::tcp::{self, TcpListenContext};
use crate::udp::{self, UdpEngineContext, UdpPort};
use anyhow::Context;
use secrecy::ExposeSecret;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Runs the rotator loop forever (until the process is signalled to exit;
/// see `main.rs`'s signal handler). Checks the current epoch once a
/// second, matching `otip_rproxy.c`'s own polling cadence.
pub fn run(config: Config, factory: Arc<dyn StackFactory>) -> anyhow::Result<()> {
    let mut last_created: Option<Epoch> = None;

    loop {
        let epoch = current_epoch(config.otip_period, config.otip_preactive, SystemTime::now());

        if last_created != Some(epoch) {
            match spawn_epoch(&config, &factory, epoch) {
                Ok(()) => last_created = Some(epoch),
                Err(e) => {
                    tracing::warn!(epoch, error = %e, "failed to stand up epoch, will retry next tick");
                }
            }
        }

        std::thread::sleep(Duration::from_secs(1));
    }
}

fn spawn_epoch(config: &Config, factory: &Arc<dyn StackFactory>, epoch: Epoch) -> anyhow::Result<()> {
    let window = EpochWindow::for_epoch(
        epoch,
        config.otip_period,
        config.otip_preactive,
        config.otip_postactive,
    );
    let address = derive_address(
        config.baseaddr,
        &config.name,
        config.passwd.expose_secret().as_bytes(),
        epoch,
    );

    let stack = factory
        .create_external_stack(&config.extstack)
        .context("create_external_stack")?;

    // Per `spec.md` §4.2/§7: a stack-creation failure skips the epoch, but
    // address-assignment/link-up failures are logged and the stack is
    // launched anyway — it just won't receive traffic. The counter is
    // created first so the stack is torn down correctly either way instead
    // of leaking if either call below fails.
    let counter = UsageCounter::new(stack, factory.clone());
    counter.acquire(); // provisional hold, released once every consumer has its own.

    let assigned = counter.with_stack(|stack| {
        if let Err(e) = factory.add_ipv6_address(stack, address, 64) {
            tracing::warn!(epoch, iface = %stack.iface, error = %e, "failed to assign OTIP address, stack will not receive traffic");
            return false;
        }
        if let Err(e) = factory.set_link_up(stack) {
            tracing::warn!(epoch, iface = %stack.iface, error = %e, "failed to bring up external stack link");
            return false;
        }
        true
    });
    if assigned == Some(true) {
        counter.set_address(address);
    }
    let bind_to_device = counter.with_stack(|stack| stack.bind_to_device).unwrap_or(true);

    let now_unix = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    let deadline = Instant::now() + Duration::from_secs(window.remaining(now_unix));

    for item in &config.tcp {
        counter.acquire();
        let ctx = TcpListenContext {
            item: item.clone(),
            external_addr: address,
            iface: config.extstack.iface.clone(),
            bind_to_device,
            internal_iface: config.intstack.clone(),
            counter: counter.clone(),
            tcp_timeout: Duration::from_secs(config.tcp_timeout),
            tcp_listen_backlog: config.tcp_listen_backlog,
        };
        std::thread::spawn(move || tcp::run_listener(ctx, deadline));
    }

    if !config.udp.is_empty() {
        counter.acquire();
        let ports = config
            .udp
            .iter()
            .map(|item| UdpPort {
                item: item.clone(),
                external_addr: address,
                iface: config.extstack.iface.clone(),
                bind_to_device,
            })
            .collect();
        let ctx = UdpEngineContext {
            ports,
            internal_iface: config.intstack.clone(),
            udp_timeout: Duration::from_secs(config.udp_timeout),
            counter: counter.clone(),
        };
        std::thread::spawn(move || udp::run_udp_engine(ctx, deadline));
    }

    counter.release();
    let fingerprint = epoch_fingerprint(&config.name, config.passwd.expose_secret().as_bytes(), epoch);
    tracing::info!(epoch, %address, %fingerprint, valid_until = window.end_unix, "epoch stack active");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExtStackConfig;
    use crate::stack::ExternalStack;
    use secrecy::SecretString;
    use std::net::Ipv6Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> Config {
        Config {
            daemon: false,
            pidfile: None,
            extstack: ExtStackConfig {
                stack: None,
                vnl: None,
                iface: "otip0".to_string(),
            },
            intstack: None,
            name: "host.example.com".to_string(),
            baseaddr: "2001:db8::".parse::<Ipv6Addr>().unwrap(),
            passwd: SecretString::from("secret".to_string()),
            tcp: vec![],
            udp: vec![],
            otip_period: 32,
            otip_preactive: 8,
            otip_postactive: 8,
            tcp_listen_backlog: 5,
            tcp_timeout: 120,
            udp_timeout: 8,
            verbose: false,
        }
    }

    /// A factory whose `add_ipv6_address` always fails, so we can check the
    /// epoch is still launched (not leaked, not aborted) per `spec.md`
    /// §4.2/§7.
    struct AddressFailsFactory {
        destroyed: Arc<AtomicUsize>,
    }

    impl StackFactory for AddressFailsFactory {
        fn create_external_stack(&self, cfg: &ExtStackConfig) -> anyhow::Result<ExternalStack> {
            Ok(ExternalStack {
                iface: cfg.iface.clone(),
                iface_index: 1,
                address: None,
                bind_to_device: false,
            })
        }
        fn destroy_external_stack(&self, _stack: ExternalStack) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
        fn add_ipv6_address(&self, _stack: &ExternalStack, _addr: Ipv6Addr, _prefix_len: u8) -> anyhow::Result<()> {
            anyhow::bail!("simulated address assignment failure")
        }
        fn set_link_up(&self, _stack: &ExternalStack) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn address_assignment_failure_still_launches_the_epoch() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let factory: Arc<dyn StackFactory> = Arc::new(AddressFailsFactory {
            destroyed: destroyed.clone(),
        });
        let cfg = config();

        // spawn_epoch must still succeed (the epoch is launched, just
        // without a working address) rather than propagating the address
        // assignment error and leaking the freshly created stack.
        spawn_epoch(&cfg, &factory, 0).expect("epoch should stand up despite address failure");

        // No relays were configured (empty tcp/udp tables), so the
        // rotator's provisional reference was the only one outstanding;
        // releasing it at the end of `spawn_epoch` must have torn the
        // stack down exactly once rather than leaking it.
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    /// A factory whose `create_external_stack` always fails: the epoch
    /// should be skipped (propagated as an error) rather than treated as
    /// launched with no stack at all.
    struct CreateFailsFactory;
    impl StackFactory for CreateFailsFactory {
        fn create_external_stack(&self, _cfg: &ExtStackConfig) -> anyhow::Result<ExternalStack> {
            anyhow::bail!("simulated stack creation failure")
        }
        fn destroy_external_stack(&self, _stack: ExternalStack) {}
        fn add_ipv6_address(&self, _stack: &ExternalStack, _addr: Ipv6Addr, _prefix_len: u8) -> anyhow::Result<()> {
            Ok(())
        }
        fn set_link_up(&self, _stack: &ExternalStack) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn stack_creation_failure_skips_the_epoch() {
        let factory: Arc<dyn StackFactory> = Arc::new(CreateFailsFactory);
        let cfg = config();
        assert!(spawn_epoch(&cfg, &factory, 0).is_err());
    }
}
