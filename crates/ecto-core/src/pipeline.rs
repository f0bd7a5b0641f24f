//! Contract compile/deploy pipeline.
//!
//! Per variant: extract the pinned compiler version from the source pragma,
//! compile with the matching `solc`, resolve the abstract constructor
//! parameters against the provisioned environment, and deploy signed by the
//! environment's designated signer (account 0).

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use regex::Regex;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};
use web3::contract::{Contract, Options};
use web3::ethabi::Token;
use web3::transports::Http;
use web3::types::{Address, U256};
use web3::Web3;

use crate::config::{ParamSpec, ProvisionerSettings};
use crate::env::EnvironmentHandle;
use crate::error::{EctoError, Result};

/// A contract instance deployed to a provisioned environment.
#[derive(Debug, Clone)]
pub struct DeployedContract {
    pub address: Address,
    pub abi: Value,
    pub bytecode: String,
    /// Index of the synthesized variant this instance was built from.
    pub variant: u32,
}

/// Parse the solidity version pragma out of contract source text.
///
/// Range pragmas (`^0.8.19`, `>=0.7.0`) resolve to their first concrete
/// version triple.
pub fn extract_compiler_version(source: &str) -> Result<String> {
    let re = Regex::new(r"pragma\s+solidity\s*[\^~>=<\s]*(\d+\.\d+\.\d+)")
        .map_err(|e| EctoError::VersionParse(format!("pragma pattern: {e}")))?;
    re.captures(source)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| EctoError::VersionParse("no solidity version pragma found".to_string()))
}

/// ABI and bytecode produced by one compilation unit.
#[derive(Debug, Clone)]
pub struct CompiledContract {
    pub abi: Value,
    pub bytecode: String,
}

/// Wrapper around the external `solc` toolchain, pinned per pragma version.
pub struct SolcCompiler {
    toolchain_dir: Option<PathBuf>,
}

impl SolcCompiler {
    /// `toolchain_dir` holds `solc-<version>` binaries; when `None`, the
    /// `solc` on `PATH` is used and its reported version must match the
    /// requested one.
    pub fn new(toolchain_dir: Option<PathBuf>) -> Self {
        Self { toolchain_dir }
    }

    /// Compile `source` as `<file_label>.sol` and extract `contract_name`'s
    /// ABI and creation bytecode. Error-severity compiler diagnostics fail
    /// the unit with [`EctoError::Compile`].
    pub async fn compile(
        &self,
        source: &str,
        file_label: &str,
        contract_name: &str,
        version: &str,
    ) -> Result<CompiledContract> {
        let binary = self.resolve_binary(version).await?;
        let unit = file_label.to_string();
        let source_key = format!("{file_label}.sol");

        let input = json!({
            "language": "Solidity",
            "sources": { &source_key: { "content": source } },
            "settings": {
                "outputSelection": { "*": { "*": ["abi", "evm.bytecode.object"] } }
            }
        });

        debug!(unit = %unit, compiler = %binary.display(), "compiling");
        let mut child = Command::new(&binary)
            .arg("--standard-json")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EctoError::Compile {
                unit: unit.clone(),
                diagnostics: format!("failed to launch {}: {e}", binary.display()),
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| EctoError::Compile {
            unit: unit.clone(),
            diagnostics: "compiler stdin not captured".to_string(),
        })?;
        stdin.write_all(&serde_json::to_vec(&input)?).await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if output.stdout.is_empty() {
            return Err(EctoError::Compile {
                unit,
                diagnostics: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        let parsed: Value =
            serde_json::from_slice(&output.stdout).map_err(|e| EctoError::Compile {
                unit: unit.clone(),
                diagnostics: format!("unreadable compiler output: {e}"),
            })?;

        let diagnostics: Vec<String> = parsed
            .get("errors")
            .and_then(Value::as_array)
            .map(|errors| {
                errors
                    .iter()
                    .filter(|e| e.get("severity").and_then(Value::as_str) == Some("error"))
                    .map(|e| {
                        e.get("formattedMessage")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown compiler error")
                            .to_string()
                    })
                    .collect()
            })
            .unwrap_or_default();
        if !diagnostics.is_empty() {
            return Err(EctoError::Compile {
                unit,
                diagnostics: diagnostics.join("\n"),
            });
        }

        let entry = parsed
            .get("contracts")
            .and_then(|c| c.get(&source_key))
            .and_then(|c| c.get(contract_name))
            .ok_or_else(|| EctoError::Compile {
                unit: unit.clone(),
                diagnostics: format!("compiler emitted no output for contract {contract_name}"),
            })?;

        let abi = entry.get("abi").cloned().ok_or_else(|| EctoError::Compile {
            unit: unit.clone(),
            diagnostics: "no abi in compiler output".to_string(),
        })?;
        let bytecode = entry
            .pointer("/evm/bytecode/object")
            .and_then(Value::as_str)
            .ok_or_else(|| EctoError::Compile {
                unit: unit.clone(),
                diagnostics: "no bytecode in compiler output".to_string(),
            })?
            .to_string();

        Ok(CompiledContract { abi, bytecode })
    }

    async fn resolve_binary(&self, version: &str) -> Result<PathBuf> {
        if let Some(dir) = &self.toolchain_dir {
            let pinned = dir.join(format!("solc-{version}"));
            if tokio::fs::metadata(&pinned).await.is_ok() {
                return Ok(pinned);
            }
            return Err(EctoError::Compile {
                unit: format!("solc-{version}"),
                diagnostics: format!(
                    "no pinned compiler solc-{version} in {}",
                    dir.display()
                ),
            });
        }

        let out = Command::new("solc")
            .arg("--version")
            .output()
            .await
            .map_err(|e| EctoError::Compile {
                unit: format!("solc-{version}"),
                diagnostics: format!("cannot run solc --version: {e}"),
            })?;
        let reported = String::from_utf8_lossy(&out.stdout).to_string();
        if !reported.contains(version) {
            return Err(EctoError::Compile {
                unit: format!("solc-{version}"),
                diagnostics: format!(
                    "toolchain mismatch: pragma pins {version}, found {}",
                    reported.trim()
                ),
            });
        }
        Ok(PathBuf::from("solc"))
    }
}

/// Map abstract parameter specs onto concrete ABI tokens for one
/// environment.
pub fn resolve_constructor_params(
    specs: &[ParamSpec],
    env: &EnvironmentHandle,
) -> Result<Vec<Token>> {
    specs.iter().map(|spec| resolve_param(spec, env)).collect()
}

fn resolve_param(spec: &ParamSpec, env: &EnvironmentHandle) -> Result<Token> {
    match spec {
        ParamSpec::Account { index } => env
            .accounts
            .get(*index)
            .map(|a| Token::Address(*a))
            .ok_or_else(|| {
                EctoError::ConstructorResolution(format!(
                    "account index {index} outside funded pool of {}",
                    env.accounts.len()
                ))
            }),
        ParamSpec::Address { value } => {
            let cleaned = value.strip_prefix("0x").unwrap_or(value);
            cleaned
                .parse::<Address>()
                .map(Token::Address)
                .map_err(|e| {
                    EctoError::ConstructorResolution(format!(
                        "invalid address literal {value}: {e:?}"
                    ))
                })
        }
        ParamSpec::Uint { value } => parse_u256(value).map(Token::Uint),
        ParamSpec::Bool { value } => Ok(Token::Bool(*value)),
        ParamSpec::String { value } => Ok(Token::String(value.clone())),
    }
}

pub(crate) fn parse_u256(value: &str) -> Result<U256> {
    let parsed = if let Some(hex_digits) = value.strip_prefix("0x") {
        U256::from_str_radix(hex_digits, 16).map_err(|e| format!("{e:?}"))
    } else {
        U256::from_dec_str(value).map_err(|e| format!("{e:?}"))
    };
    parsed.map_err(|e| EctoError::ConstructorResolution(format!("invalid uint literal {value}: {e}")))
}

/// Submit the deployment transaction, signed by account 0, and wait for
/// one confirmation bounded by the configured deploy timeout.
pub async fn deploy(
    client: &Web3<Http>,
    compiled: &CompiledContract,
    env: &EnvironmentHandle,
    args: Vec<Token>,
    variant: u32,
    settings: &ProvisionerSettings,
) -> Result<DeployedContract> {
    let signer = env.private_keys.first().ok_or_else(|| {
        EctoError::Deployment("environment has no signer account".to_string())
    })?;
    let abi_bytes = serde_json::to_vec(&compiled.abi)?;
    let gas = settings.gas_limit;

    let builder = Contract::deploy(client.eth(), &abi_bytes)
        .map_err(|e| EctoError::Deployment(format!("invalid abi: {e}")))?
        .confirmations(1)
        .poll_interval(Duration::from_millis(100))
        .options(Options::with(|opt| {
            opt.gas = Some(gas.into());
        }));

    let pending = builder.sign_with_key_and_execute(compiled.bytecode.as_str(), args, signer, None);
    let contract = tokio::time::timeout(settings.deploy_timeout(), pending)
        .await
        .map_err(|_| {
            EctoError::Deployment(format!(
                "no confirmation within {:?}",
                settings.deploy_timeout()
            ))
        })?
        .map_err(|e| EctoError::Deployment(e.to_string()))?;

    info!(address = %format!("{:#x}", contract.address()), variant, "contract deployed");
    Ok(DeployedContract {
        address: contract.address(),
        abi: compiled.abi.clone(),
        bytecode: compiled.bytecode.clone(),
        variant,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::generate_account_pool;
    use std::os::unix::fs::PermissionsExt;

    fn test_env() -> EnvironmentHandle {
        let (accounts, private_keys) = generate_account_pool(3);
        EnvironmentHandle {
            rpc_url: "http://127.0.0.1:1".to_string(),
            accounts,
            private_keys,
            pid: 1,
        }
    }

    fn write_stub_solc(dir: &std::path::Path, version: &str, body: &str) -> PathBuf {
        let path = dir.join(format!("solc-{version}"));
        std::fs::write(&path, format!("#!/bin/sh\ncat > /dev/null\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_extract_caret_pragma() {
        let source = "// SPDX-License-Identifier: MIT\npragma solidity ^0.8.19;\ncontract A {}";
        assert_eq!(extract_compiler_version(source).unwrap(), "0.8.19");
    }

    #[test]
    fn test_extract_range_pragma_takes_first_triple() {
        let source = "pragma solidity >=0.7.0 <0.9.0;";
        assert_eq!(extract_compiler_version(source).unwrap(), "0.7.0");
    }

    #[test]
    fn test_missing_pragma_fails() {
        let result = extract_compiler_version("contract A {}");
        assert!(matches!(result, Err(EctoError::VersionParse(_))));
    }

    #[test]
    fn test_malformed_pragma_fails() {
        let result = extract_compiler_version("pragma solidity latest;");
        assert!(matches!(result, Err(EctoError::VersionParse(_))));
    }

    #[test]
    fn test_resolve_account_param() {
        let env = test_env();
        let tokens = resolve_constructor_params(&[ParamSpec::Account { index: 1 }], &env).unwrap();
        assert_eq!(tokens, vec![Token::Address(env.accounts[1])]);
    }

    #[test]
    fn test_resolve_account_out_of_pool() {
        let env = test_env();
        let result = resolve_constructor_params(&[ParamSpec::Account { index: 7 }], &env);
        assert!(matches!(result, Err(EctoError::ConstructorResolution(_))));
    }

    #[test]
    fn test_resolve_literals() {
        let env = test_env();
        let specs = vec![
            ParamSpec::Uint {
                value: "1000".to_string(),
            },
            ParamSpec::Uint {
                value: "0xff".to_string(),
            },
            ParamSpec::Bool { value: true },
            ParamSpec::String {
                value: "vault".to_string(),
            },
        ];
        let tokens = resolve_constructor_params(&specs, &env).unwrap();
        assert_eq!(tokens[0], Token::Uint(U256::from(1000)));
        assert_eq!(tokens[1], Token::Uint(U256::from(255)));
        assert_eq!(tokens[2], Token::Bool(true));
        assert_eq!(tokens[3], Token::String("vault".to_string()));
    }

    #[test]
    fn test_resolve_bad_uint_literal() {
        let env = test_env();
        let result = resolve_constructor_params(
            &[ParamSpec::Uint {
                value: "not-a-number".to_string(),
            }],
            &env,
        );
        assert!(matches!(result, Err(EctoError::ConstructorResolution(_))));
    }

    #[test]
    fn test_resolve_bad_address_literal() {
        let env = test_env();
        let result = resolve_constructor_params(
            &[ParamSpec::Address {
                value: "0x123".to_string(),
            }],
            &env,
        );
        assert!(matches!(result, Err(EctoError::ConstructorResolution(_))));
    }

    #[tokio::test]
    async fn test_compile_with_pinned_stub() {
        let dir = tempfile::tempdir().unwrap();
        write_stub_solc(
            dir.path(),
            "0.8.19",
            r#"echo '{"contracts":{"Vault-1.sol":{"Vault":{"abi":[],"evm":{"bytecode":{"object":"6080604052"}}}}}}'"#,
        );

        let compiler = SolcCompiler::new(Some(dir.path().to_path_buf()));
        let compiled = compiler
            .compile("contract Vault {}", "Vault-1", "Vault", "0.8.19")
            .await
            .expect("compile failed");
        assert_eq!(compiled.bytecode, "6080604052");
        assert!(compiled.abi.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_compile_surfaces_error_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        write_stub_solc(
            dir.path(),
            "0.8.19",
            r#"echo '{"errors":[{"severity":"error","formattedMessage":"ParserError: expected semicolon"}]}'"#,
        );

        let compiler = SolcCompiler::new(Some(dir.path().to_path_buf()));
        let result = compiler
            .compile("contract Vault {", "Vault-1", "Vault", "0.8.19")
            .await;
        match result {
            Err(EctoError::Compile { diagnostics, .. }) => {
                assert!(diagnostics.contains("ParserError"))
            }
            other => panic!("expected Compile error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_compile_ignores_warning_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        write_stub_solc(
            dir.path(),
            "0.8.19",
            r#"echo '{"errors":[{"severity":"warning","formattedMessage":"unused variable"}],"contracts":{"Vault-1.sol":{"Vault":{"abi":[],"evm":{"bytecode":{"object":"60"}}}}}}'"#,
        );

        let compiler = SolcCompiler::new(Some(dir.path().to_path_buf()));
        let compiled = compiler
            .compile("contract Vault {}", "Vault-1", "Vault", "0.8.19")
            .await
            .expect("warnings must not fail the unit");
        assert_eq!(compiled.bytecode, "60");
    }

    #[tokio::test]
    async fn test_missing_pinned_compiler_fails() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = SolcCompiler::new(Some(dir.path().to_path_buf()));
        let result = compiler
            .compile("contract Vault {}", "Vault-1", "Vault", "0.4.24")
            .await;
        match result {
            Err(EctoError::Compile { diagnostics, .. }) => {
                assert!(diagnostics.contains("solc-0.4.24"))
            }
            other => panic!("expected Compile error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_compile_missing_contract_entry_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_stub_solc(
            dir.path(),
            "0.8.19",
            r#"echo '{"contracts":{"Vault-1.sol":{}}}'"#,
        );

        let compiler = SolcCompiler::new(Some(dir.path().to_path_buf()));
        let result = compiler
            .compile("contract Vault {}", "Vault-1", "Vault", "0.8.19")
            .await;
        match result {
            Err(EctoError::Compile { diagnostics, .. }) => {
                assert!(diagnostics.contains("Vault"))
            }
            other => panic!("expected Compile error, got {other:?}"),
        }
    }
}
