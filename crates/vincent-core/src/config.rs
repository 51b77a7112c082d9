use crate::account::AccountRole;
use crate::error::{E2eError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const ENV_NETWORK: &str = "VINCENT_E2E_NETWORK";
pub const ENV_STATE_FILE: &str = "VINCENT_E2E_STATE_FILE";

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// LitNetwork
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LitNetwork {
    #[default]
    Datil,
    DatilTest,
    DatilDev,
}

impl LitNetwork {
    pub fn as_str(self) -> &'static str {
        match self {
            LitNetwork::Datil => "datil",
            LitNetwork::DatilTest => "datil-test",
            LitNetwork::DatilDev => "datil-dev",
        }
    }
}

impl fmt::Display for LitNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LitNetwork {
    type Err = E2eError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "datil" => Ok(LitNetwork::Datil),
            "datil-test" => Ok(LitNetwork::DatilTest),
            "datil-dev" => Ok(LitNetwork::DatilDev),
            other => Err(E2eError::InvalidNetwork(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// KeyOverrides
// ---------------------------------------------------------------------------

/// Externally supplied private keys. A role with an override is never
/// generated or cached.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_manager: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_delegatee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_wallet_pkp_owner: Option<String>,
}

impl KeyOverrides {
    pub fn for_role(&self, role: AccountRole) -> Option<&str> {
        match role {
            AccountRole::AppManager => self.app_manager.as_deref(),
            AccountRole::AppDelegatee => self.app_delegatee.as_deref(),
            AccountRole::AgentWalletPkpOwner => self.agent_wallet_pkp_owner.as_deref(),
        }
    }

    /// Trim every key and treat blank ones as unset.
    fn normalize(&mut self) {
        for role in AccountRole::ALL {
            let slot = self.slot_mut(role);
            *slot = slot
                .take()
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty());
        }
    }

    fn slot_mut(&mut self, role: AccountRole) -> &mut Option<String> {
        match role {
            AccountRole::AppManager => &mut self.app_manager,
            AccountRole::AppDelegatee => &mut self.app_delegatee,
            AccountRole::AgentWalletPkpOwner => &mut self.agent_wallet_pkp_owner,
        }
    }
}

// ---------------------------------------------------------------------------
// E2eConfig (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct E2eConfig {
    #[serde(default)]
    pub network: LitNetwork,
    /// State file location, relative paths resolve against the project root.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default)]
    pub keys: KeyOverrides,
}

fn default_state_file() -> PathBuf {
    PathBuf::from(paths::STATE_FILE)
}

impl Default for E2eConfig {
    fn default() -> Self {
        Self {
            network: LitNetwork::default(),
            state_file: default_state_file(),
            keys: KeyOverrides::default(),
        }
    }
}

impl E2eConfig {
    pub fn new(network: LitNetwork) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }

    /// Load `.vincent-e2e.yaml` from `root`, or defaults when it is absent.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        let Some(data) = crate::io::read_if_exists(&path)? else {
            return Ok(Self::default());
        };
        let mut config: Self = serde_yaml::from_str(&data)?;
        config.keys.normalize();
        Ok(config)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    /// File config overlaid with the process environment.
    pub fn load_with_env(root: &Path) -> Result<Self> {
        Self::load(root)?.with_env(|key| std::env::var(key).ok())
    }

    /// Overlay values from `lookup` (normally the process environment).
    /// Empty values are ignored.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(network) = get(ENV_NETWORK) {
            self.network = network.trim().parse()?;
        }
        if let Some(state_file) = get(ENV_STATE_FILE) {
            self.state_file = PathBuf::from(state_file);
        }
        for role in AccountRole::ALL {
            if let Some(key) = get(role.env_var()) {
                *self.keys.slot_mut(role) = Some(key.trim().to_string());
            }
        }
        Ok(self)
    }

    pub fn state_path(&self, root: &Path) -> PathBuf {
        if self.state_file.is_absolute() {
            self.state_file.clone()
        } else {
            root.join(&self.state_file)
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        for role in AccountRole::ALL {
            match self.keys.for_role(role) {
                None => warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!(
                        "optional {} is not set; the {} account will be generated",
                        role.env_var(),
                        role.as_str()
                    ),
                }),
                Some(key) if key.trim_start_matches("0x").len() < 64 => {
                    warnings.push(ConfigWarning {
                        level: WarnLevel::Error,
                        message: format!(
                            "{} must be at least 64 hex characters",
                            role.env_var()
                        ),
                    })
                }
                Some(_) => {}
            }
        }

        if self.state_file.as_os_str().is_empty() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "state_file must not be empty".to_string(),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
