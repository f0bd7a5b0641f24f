//! Campaign configuration schema.
//!
//! A campaign config is loaded once from a JSON file and stays immutable for
//! the whole run. It lists the synthesized contracts under test, the
//! detection models that can be attached to them, and the test suites that
//! bind an environment flavor to a set of exploit scripts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EctoError, Result};

/// Fixed size of the funded account pool per environment.
pub const ACCOUNT_POOL: usize = 10;

/// An abstract constructor / call parameter that is resolved against a
/// provisioned environment just before use.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamSpec {
    /// The address of funded account `index` in the environment pool.
    Account { index: usize },
    /// A literal address, hex-encoded with `0x` prefix.
    Address { value: String },
    /// A literal unsigned integer, decimal or `0x`-prefixed hex.
    Uint { value: String },
    /// A literal boolean.
    Bool { value: bool },
    /// A literal string.
    String { value: String },
}

/// One synthesized contract under test.
///
/// `variants` counts the synthesized source versions (`<name>-1.sol` ..
/// `<name>-N.sol` under the contracts directory). Each variant is exercised
/// once per referenced model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractDescriptor {
    /// Contract name as it appears in the source file.
    pub name: String,

    /// Number of synthesized variants.
    pub variants: u32,

    /// Ids of the models to attach, in priority order.
    pub models: Vec<String>,

    /// Names of the test suites to run, in priority order. Only the first
    /// is consulted today; the rest are reserved.
    pub tests: Vec<String>,

    /// Constructor parameter specs, resolved per environment.
    #[serde(default)]
    pub constructor_params: Vec<ParamSpec>,
}

/// Configuration bundle for one detection model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model id, unique within the campaign.
    pub id: String,

    /// Whether the model computes a response relation over observed events.
    #[serde(default)]
    pub has_response_relation: bool,

    /// Per-function parameter configuration keyed by contract function name.
    #[serde(default)]
    pub function_params: std::collections::BTreeMap<String, serde_json::Value>,

    /// Activity set the monitor watches for.
    #[serde(default)]
    pub activities: Vec<String>,
}

/// A test suite: an environment flavor plus the exploit scripts to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestDescriptor {
    /// Suite name referenced from [`ContractDescriptor::tests`].
    pub name: String,

    /// Environment flavor name (e.g. `anvil`, `solana-test-validator`).
    pub environment: String,

    /// Exploit script names. Each maps to a registry entry at run time.
    pub files: Vec<String>,
}

fn default_base_port() -> u16 {
    3000
}

fn default_scan_width() -> u16 {
    100
}

fn default_readiness_timeout() -> u64 {
    60
}

fn default_safety_timeout() -> u64 {
    500
}

fn default_deploy_timeout() -> u64 {
    60
}

fn default_gas_limit() -> u64 {
    5_000_000
}

/// Tunables for environment provisioning and teardown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionerSettings {
    /// First port of the scan range.
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Number of ports to scan.
    #[serde(default = "default_scan_width")]
    pub scan_width: u16,

    /// Seconds to wait for the node's readiness marker.
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: u64,

    /// Last-resort seconds before an environment is force-killed even if
    /// monitors never complete.
    #[serde(default = "default_safety_timeout")]
    pub safety_timeout_secs: u64,

    /// Seconds to wait for a deployment transaction to confirm.
    #[serde(default = "default_deploy_timeout")]
    pub deploy_timeout_secs: u64,

    /// Gas limit for deployment and exploit transactions.
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
}

impl Default for ProvisionerSettings {
    fn default() -> Self {
        Self {
            base_port: default_base_port(),
            scan_width: default_scan_width(),
            readiness_timeout_secs: default_readiness_timeout(),
            safety_timeout_secs: default_safety_timeout(),
            deploy_timeout_secs: default_deploy_timeout(),
            gas_limit: default_gas_limit(),
        }
    }
}

impl ProvisionerSettings {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn safety_timeout(&self) -> Duration {
        Duration::from_secs(self.safety_timeout_secs)
    }

    pub fn deploy_timeout(&self) -> Duration {
        Duration::from_secs(self.deploy_timeout_secs)
    }
}

/// Root campaign configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignConfig {
    /// Human-readable campaign name.
    #[serde(default)]
    pub name: Option<String>,

    /// Directory holding synthesized contract sources
    /// (`<name>-<variant>.sol`).
    pub contracts_dir: PathBuf,

    /// Directory holding pinned `solc-<version>` binaries. When unset the
    /// `solc` on `PATH` is used and its version verified.
    #[serde(default)]
    pub toolchain_dir: Option<PathBuf>,

    #[serde(default)]
    pub provisioner: ProvisionerSettings,

    pub contracts: Vec<ContractDescriptor>,

    #[serde(default)]
    pub models: Vec<ModelConfig>,

    #[serde(default)]
    pub tests: Vec<TestDescriptor>,
}

impl CampaignConfig {
    /// Load and validate a campaign config from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EctoError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| EctoError::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation. Reference resolution (model ids, suite names)
    /// is deliberately left to run time so a dangling reference degrades to
    /// recorded failures instead of rejecting the whole campaign.
    pub fn validate(&self) -> Result<()> {
        if self.contracts.is_empty() {
            return Err(EctoError::Config("no contracts configured".to_string()));
        }
        for contract in &self.contracts {
            if contract.variants == 0 {
                return Err(EctoError::Config(format!(
                    "contract {} has zero variants",
                    contract.name
                )));
            }
            if contract.models.is_empty() {
                return Err(EctoError::Config(format!(
                    "contract {} references no models",
                    contract.name
                )));
            }
            for spec in &contract.constructor_params {
                if let ParamSpec::Account { index } = spec {
                    if *index >= ACCOUNT_POOL {
                        return Err(EctoError::Config(format!(
                            "contract {} constructor references account {} outside the pool of {}",
                            contract.name, index, ACCOUNT_POOL
                        )));
                    }
                }
            }
        }
        if self.provisioner.scan_width == 0 {
            return Err(EctoError::Config("scan_width must be positive".to_string()));
        }
        Ok(())
    }

    /// Look up a model by id.
    pub fn model(&self, id: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.id == id)
    }

    /// Look up a test suite by name.
    pub fn test(&self, name: &str) -> Option<&TestDescriptor> {
        self.tests.iter().find(|t| t.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "name": "synthesized-sweep",
            "contracts_dir": "./contracts/src/synthesized",
            "contracts": [
                {
                    "name": "Vault",
                    "variants": 2,
                    "models": ["m-reentrancy"],
                    "tests": ["vault-suite"],
                    "constructor_params": [
                        {"type": "account", "index": 1},
                        {"type": "uint", "value": "1000"}
                    ]
                }
            ],
            "models": [
                {
                    "id": "m-reentrancy",
                    "has_response_relation": true,
                    "activities": ["deposit", "withdraw"]
                }
            ],
            "tests": [
                {
                    "name": "vault-suite",
                    "environment": "anvil",
                    "files": ["VaultExploit"]
                }
            ]
        }"#
    }

    #[test]
    fn test_parse_sample_config() {
        let config: CampaignConfig = serde_json::from_str(sample_json()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.contracts.len(), 1);
        let vault = &config.contracts[0];
        assert_eq!(vault.name, "Vault");
        assert_eq!(vault.variants, 2);
        assert_eq!(
            vault.constructor_params[0],
            ParamSpec::Account { index: 1 }
        );

        let model = config.model("m-reentrancy").unwrap();
        assert!(model.has_response_relation);
        assert_eq!(model.activities, vec!["deposit", "withdraw"]);

        let suite = config.test("vault-suite").unwrap();
        assert_eq!(suite.environment, "anvil");
    }

    #[test]
    fn test_defaults_applied() {
        let config: CampaignConfig = serde_json::from_str(sample_json()).unwrap();
        assert_eq!(config.provisioner.base_port, 3000);
        assert_eq!(config.provisioner.scan_width, 100);
        assert_eq!(config.provisioner.safety_timeout_secs, 500);
    }

    #[test]
    fn test_empty_contracts_rejected() {
        let json = r#"{"contracts_dir": ".", "contracts": []}"#;
        let config: CampaignConfig = serde_json::from_str(json).unwrap();
        assert!(matches!(config.validate(), Err(EctoError::Config(_))));
    }

    #[test]
    fn test_account_index_outside_pool_rejected() {
        let mut config: CampaignConfig = serde_json::from_str(sample_json()).unwrap();
        config.contracts[0].constructor_params = vec![ParamSpec::Account { index: 10 }];
        assert!(matches!(config.validate(), Err(EctoError::Config(_))));
    }

    #[test]
    fn test_unknown_model_is_not_a_load_error() {
        let mut config: CampaignConfig = serde_json::from_str(sample_json()).unwrap();
        config.contracts[0].models = vec!["missing".to_string()];
        // Dangling refs degrade at run time; validation accepts them.
        config.validate().unwrap();
        assert!(config.model("missing").is_none());
    }
}
