//! Disposable test-network provisioning.
//!
//! An environment is one chain-node process plus a pool of funded accounts
//! and a shared RPC client. Readiness is detected from the node's stdout
//! stream; any stderr output during startup fails provisioning outright
//! (transient warnings are indistinguishable from fatal errors at this
//! boundary, and the strict policy is part of the external contract).

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use rand::RngCore;
use regex::Regex;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use web3::signing::{Key, SecretKey, SecretKeyRef};
use web3::transports::Http;
use web3::types::{Address, U256};
use web3::{Transport, Web3};

use crate::config::{ProvisionerSettings, ACCOUNT_POOL};
use crate::error::{EctoError, Result};

/// How a flavor funds freshly generated accounts.
#[derive(Debug, Clone)]
pub enum FundingStyle {
    /// Dev-node balance override (e.g. `anvil_setBalance`).
    SetBalance { method: String, amount_wei: U256 },
    /// Faucet-style airdrop (e.g. `requestAirdrop`).
    Airdrop { method: String, amount: u64 },
}

/// Launch recipe for one chain-node flavor: the command, its fixed argument
/// list, and the textual contract of its startup output.
#[derive(Debug, Clone)]
pub struct NodeFlavor {
    pub name: String,
    pub command: String,
    /// Argument template; `{port}` and `{ledger}` are substituted at spawn.
    pub args: Vec<String>,
    /// Substring of accumulated stdout that signals readiness.
    pub ready_marker: String,
    /// Regex with one capture group yielding the `host:port` of the RPC
    /// endpoint, matched against accumulated startup output.
    pub endpoint_pattern: String,
    pub funding: FundingStyle,
    /// Ledger scratch directory, substituted for `{ledger}`.
    pub ledger_dir: String,
    /// Working-directory override for the node process.
    pub workdir: Option<PathBuf>,
}

impl NodeFlavor {
    pub fn anvil() -> Self {
        Self {
            name: "anvil".to_string(),
            command: "anvil".to_string(),
            args: vec!["--port".to_string(), "{port}".to_string()],
            ready_marker: "Listening on".to_string(),
            endpoint_pattern: r"Listening on (\d+\.\d+\.\d+\.\d+:\d+)".to_string(),
            funding: FundingStyle::SetBalance {
                method: "anvil_setBalance".to_string(),
                // 10k ether per account.
                amount_wei: U256::exp10(22),
            },
            ledger_dir: ".anvil".to_string(),
            workdir: None,
        }
    }

    pub fn solana_test_validator() -> Self {
        Self {
            name: "solana-test-validator".to_string(),
            command: "solana-test-validator".to_string(),
            args: vec![
                "--rpc-port".to_string(),
                "{port}".to_string(),
                "--reset".to_string(),
                "--ledger".to_string(),
                "{ledger}".to_string(),
            ],
            ready_marker: "WebSocket PubSub URL:".to_string(),
            endpoint_pattern: r"JSON RPC URL: http://(\d+\.\d+\.\d+\.\d+:\d+)".to_string(),
            funding: FundingStyle::Airdrop {
                method: "requestAirdrop".to_string(),
                amount: 10_000 * 1_000_000_000,
            },
            ledger_dir: ".solana-test-validator".to_string(),
            workdir: std::env::var_os("HOME").map(PathBuf::from),
        }
    }

    /// Resolve a built-in flavor by name.
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "anvil" => Some(Self::anvil()),
            "solana-test-validator" => Some(Self::solana_test_validator()),
            _ => None,
        }
    }

    fn rendered_args(&self, port: u16) -> Vec<String> {
        self.args
            .iter()
            .map(|a| {
                a.replace("{port}", &port.to_string())
                    .replace("{ledger}", &self.ledger_dir)
            })
            .collect()
    }
}

/// Connection and account information for one provisioned test network.
///
/// Invariant: `accounts` and `private_keys` have the same fixed length
/// ([`ACCOUNT_POOL`]) and index-aligned correspondence. Account 0 is the
/// designated deployment signer.
#[derive(Debug, Clone)]
pub struct EnvironmentHandle {
    pub rpc_url: String,
    pub accounts: Vec<Address>,
    pub private_keys: Vec<SecretKey>,
    pub pid: u32,
}

/// Count of monitors still attached to an environment. Teardown fires when
/// it drains to zero.
#[derive(Debug, Default)]
pub struct ActiveMonitors {
    count: Mutex<usize>,
    notify: Notify,
}

impl ActiveMonitors {
    pub async fn register(&self) {
        *self.count.lock().await += 1;
    }

    pub async fn release(&self) {
        let mut count = self.count.lock().await;
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.notify.notify_waiters();
        }
    }

    pub async fn active(&self) -> usize {
        *self.count.lock().await
    }

    /// Resolves once no monitors are attached. Returns immediately when the
    /// count is already zero.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.notify.notified();
            if *self.count.lock().await == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// A live environment: the handle, the shared RPC client, the node process,
/// and the tracked (but unawaited) funding requests.
#[derive(Debug)]
pub struct Environment {
    pub handle: EnvironmentHandle,
    pub client: Arc<Web3<Http>>,
    monitors: Arc<ActiveMonitors>,
    funding: Vec<JoinHandle<std::result::Result<(), String>>>,
    child: Child,
}

impl Environment {
    pub fn monitors(&self) -> Arc<ActiveMonitors> {
        Arc::clone(&self.monitors)
    }

    /// Await the funding requests issued at provisioning time.
    ///
    /// Provisioning itself is fast-unconfirmed: the handle is returned before
    /// any funding has landed. Callers that need confirmed balances opt into
    /// the slow path here.
    pub async fn wait_funded(&mut self) -> Result<()> {
        for task in self.funding.drain(..) {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    return Err(EctoError::Provisioning(format!(
                        "funding request failed: {e}"
                    )))
                }
                Err(e) => {
                    return Err(EctoError::Provisioning(format!("funding task died: {e}")))
                }
            }
        }
        Ok(())
    }

    /// Kill the node process and reap it.
    pub async fn terminate(mut self) {
        debug!(pid = self.handle.pid, "terminating environment process");
        for task in self.funding.drain(..) {
            task.abort();
        }
        if let Err(e) = self.child.start_kill() {
            debug!("kill failed, process likely already exited: {e}");
        }
        let _ = self.child.wait().await;
    }
}

/// Spawns chain-node processes and turns them into [`Environment`]s.
pub struct EnvironmentProvisioner {
    flavor: NodeFlavor,
    settings: ProvisionerSettings,
}

impl EnvironmentProvisioner {
    pub fn new(flavor: NodeFlavor, settings: ProvisionerSettings) -> Self {
        Self { flavor, settings }
    }

    pub fn flavor(&self) -> &NodeFlavor {
        &self.flavor
    }

    /// Launch a node on `port` and suspend until it reports readiness.
    ///
    /// Fails with [`EctoError::Provisioning`] on any stderr output or early
    /// process exit, and with [`EctoError::ProvisioningTimeout`] when the
    /// readiness marker is not observed in time. No handle to a dead process
    /// is ever returned.
    pub async fn provision(&self, port: u16) -> Result<Environment> {
        let endpoint_re = Regex::new(&self.flavor.endpoint_pattern)
            .map_err(|e| EctoError::Provisioning(format!("invalid endpoint pattern: {e}")))?;

        info!(flavor = %self.flavor.name, port, "launching node process");
        let mut cmd = Command::new(&self.flavor.command);
        cmd.args(self.flavor.rendered_args(port))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.flavor.workdir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            EctoError::Provisioning(format!("failed to spawn {}: {e}", self.flavor.command))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| EctoError::Provisioning("node process has no pid".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EctoError::Provisioning("node stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EctoError::Provisioning("node stderr not captured".to_string()))?;

        // First stderr line fails provisioning; the watcher keeps draining
        // afterwards so the child never blocks on a full pipe.
        let (err_tx, err_rx) = oneshot::channel();
        tokio::spawn(async move {
            let mut err_tx = Some(err_tx);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(tx) = err_tx.take() {
                    let _ = tx.send(line);
                }
            }
        });

        let mut out_lines = BufReader::new(stdout).lines();
        let mut accumulated = String::new();

        let readiness = async {
            loop {
                match out_lines.next_line().await {
                    Ok(Some(line)) => {
                        accumulated.push_str(&line);
                        accumulated.push('\n');
                        if accumulated.contains(&self.flavor.ready_marker) {
                            return Ok(());
                        }
                    }
                    Ok(None) => {
                        return Err(EctoError::Provisioning(
                            "node exited before reporting readiness".to_string(),
                        ))
                    }
                    Err(e) => {
                        return Err(EctoError::Provisioning(format!(
                            "cannot read node output: {e}"
                        )))
                    }
                }
            }
        };

        // Resolves only on actual stderr output; a silently closed stderr
        // pends forever so readiness detection keeps running.
        let stderr_signal = async move {
            match err_rx.await {
                Ok(line) => line,
                Err(_closed) => std::future::pending().await,
            }
        };

        let wait = self.settings.readiness_timeout();
        let outcome = tokio::time::timeout(wait, async {
            tokio::select! {
                result = readiness => result,
                line = stderr_signal => {
                    Err(EctoError::Provisioning(format!(
                        "node wrote to stderr during startup: {line}"
                    )))
                }
            }
        })
        .await;

        match outcome {
            Err(_elapsed) => {
                kill_quietly(&mut child).await;
                return Err(EctoError::ProvisioningTimeout(wait));
            }
            Ok(Err(e)) => {
                kill_quietly(&mut child).await;
                return Err(e);
            }
            Ok(Ok(())) => {}
        }

        // Readiness seen: stop accumulating, keep the pipe drained.
        tokio::spawn(async move {
            let mut reader = out_lines.into_inner();
            let mut sink = tokio::io::sink();
            let _ = tokio::io::copy(&mut reader, &mut sink).await;
        });

        let endpoint = match endpoint_re
            .captures(&accumulated)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
        {
            Some(endpoint) => endpoint,
            None => {
                kill_quietly(&mut child).await;
                return Err(EctoError::Provisioning(
                    "readiness marker present but no RPC endpoint in output".to_string(),
                ));
            }
        };

        let rpc_url = format!("http://{endpoint}");
        let transport = Http::new(&rpc_url)
            .map_err(|e| EctoError::Provisioning(format!("cannot construct rpc client: {e}")))?;
        let client = Arc::new(Web3::new(transport));

        let (accounts, private_keys) = generate_account_pool(ACCOUNT_POOL);

        // Fire-and-forget funding: tracked so Environment::wait_funded can
        // opt into confirmed semantics, but not awaited here.
        let mut funding = Vec::with_capacity(accounts.len());
        for account in &accounts {
            let client = Arc::clone(&client);
            let (method, params) = funding_request(&self.flavor.funding, account);
            let account = *account;
            funding.push(tokio::spawn(async move {
                match client.transport().execute(&method, params).await {
                    Ok(_) => {
                        debug!(account = %format!("{account:#x}"), "funding request submitted");
                        Ok(())
                    }
                    Err(e) => {
                        warn!(account = %format!("{account:#x}"), "funding request failed: {e}");
                        Err(e.to_string())
                    }
                }
            }));
        }

        info!(
            rpc = %rpc_url,
            pid,
            accounts = accounts.len(),
            "environment ready, funding unconfirmed"
        );

        Ok(Environment {
            handle: EnvironmentHandle {
                rpc_url,
                accounts,
                private_keys,
                pid,
            },
            client,
            monitors: Arc::new(ActiveMonitors::default()),
            funding,
            child,
        })
    }
}

async fn kill_quietly(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

fn funding_request(style: &FundingStyle, account: &Address) -> (String, Vec<serde_json::Value>) {
    match style {
        FundingStyle::SetBalance { method, amount_wei } => (
            method.clone(),
            vec![
                json!(format!("{account:#x}")),
                json!(format!("{amount_wei:#x}")),
            ],
        ),
        FundingStyle::Airdrop { method, amount } => (
            method.clone(),
            vec![json!(format!("{account:#x}")), json!(amount)],
        ),
    }
}

/// Generate `size` secp256k1 keypairs with their derived addresses.
pub(crate) fn generate_account_pool(size: usize) -> (Vec<Address>, Vec<SecretKey>) {
    let mut rng = rand::thread_rng();
    let mut accounts = Vec::with_capacity(size);
    let mut keys = Vec::with_capacity(size);
    while accounts.len() < size {
        let mut buf = [0u8; 32];
        rng.fill_bytes(&mut buf);
        // from_slice rejects zero and out-of-order scalars; draw again.
        if let Ok(key) = SecretKey::from_slice(&buf) {
            accounts.push(SecretKeyRef::new(&key).address());
            keys.push(key);
        }
    }
    (accounts, keys)
}
