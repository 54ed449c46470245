//! Per-container OS principals

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::distr::Alphanumeric;
use rand::Rng;

use crate::platform::{self, ps_quote};
use crate::{Error, Result};

const USER_NAME_PREFIX: &str = "c_";
const PASSWORD_LENGTH: usize = 24;

/// Logon material for a container user
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user_name: String,
    pub password: String,
    pub domain: Option<String>,
}

impl Credentials {
    pub fn new(user_name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            password: password.into(),
            domain: None,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user_name", &self.user_name)
            .field("password", &"<redacted>")
            .field("domain", &self.domain)
            .finish()
    }
}

/// Local account management
#[cfg_attr(test, mockall::automock)]
pub trait UserManager: Send + Sync {
    /// Create the account and add it to `group`
    fn create_user(&self, user_name: &str, password: &str, group: &str) -> Result<()>;

    /// Delete the account; an unknown account is not an error
    fn delete_user(&self, user_name: &str) -> Result<()>;

    fn user_exists(&self, user_name: &str) -> Result<bool>;

    fn get_sid(&self, user_name: &str) -> Result<String>;

    fn create_profile(&self, user_name: &str, password: &str) -> Result<()>;

    fn delete_profile(&self, user_name: &str) -> Result<()>;
}

/// `Microsoft.PowerShell.LocalAccounts` cmdlets
#[derive(Debug, Default, Clone)]
pub struct LocalUserManager;

impl LocalUserManager {
    pub fn new() -> Self {
        Self
    }
}

impl UserManager for LocalUserManager {
    fn create_user(&self, user_name: &str, password: &str, group: &str) -> Result<()> {
        let script = format!(
            r#"
            $ErrorActionPreference = 'Stop'
            $password = ConvertTo-SecureString {password} -AsPlainText -Force
            New-LocalUser -Name {user} -Password $password -PasswordNeverExpires -UserMayNotChangePassword | Out-Null
            if (-not (Get-LocalGroup -Name {group} -ErrorAction SilentlyContinue)) {{
                New-LocalGroup -Name {group} | Out-Null
            }}
            Add-LocalGroupMember -Group {group} -Member {user}
            "#,
            password = ps_quote(password),
            user = ps_quote(user_name),
            group = ps_quote(group),
        );
        platform::run_powershell(&script)?;
        tracing::info!(user = user_name, group, "created local user");
        Ok(())
    }

    fn delete_user(&self, user_name: &str) -> Result<()> {
        let script = format!(
            "Remove-LocalUser -Name {} -ErrorAction SilentlyContinue",
            ps_quote(user_name)
        );
        platform::run_powershell(&script)?;
        tracing::info!(user = user_name, "deleted local user");
        Ok(())
    }

    fn user_exists(&self, user_name: &str) -> Result<bool> {
        let script = format!(
            "[bool](Get-LocalUser -Name {} -ErrorAction SilentlyContinue)",
            ps_quote(user_name)
        );
        Ok(platform::run_powershell(&script)?.trim().eq_ignore_ascii_case("true"))
    }

    fn get_sid(&self, user_name: &str) -> Result<String> {
        let script = format!(
            "$ErrorActionPreference = 'Stop'; (Get-LocalUser -Name {}).SID.Value",
            ps_quote(user_name)
        );
        let sid = platform::run_powershell(&script)?.trim().to_string();
        if sid.is_empty() {
            return Err(Error::InvalidArgument(format!("no SID for user {user_name}")));
        }
        Ok(sid)
    }

    fn create_profile(&self, user_name: &str, _password: &str) -> Result<()> {
        // The profile is materialized on first logon-with-profile by the host launch
        tracing::debug!(user = user_name, "profile will be created at first logon");
        Ok(())
    }

    fn delete_profile(&self, user_name: &str) -> Result<()> {
        let sid = match self.get_sid(user_name) {
            Ok(sid) => sid,
            Err(_) => return Ok(()),
        };
        let script = format!(
            "Get-CimInstance Win32_UserProfile | Where-Object {{ $_.SID -eq {} }} | Remove-CimInstance",
            ps_quote(&sid)
        );
        platform::run_powershell(&script)?;
        Ok(())
    }
}

/// The OS principal a container's processes run as.
///
/// Deletion is idempotent: only the first call reaches the user manager.
pub struct ContainerUser {
    credentials: Credentials,
    manager: Arc<dyn UserManager>,
    deleted: AtomicBool,
}

impl std::fmt::Debug for ContainerUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerUser")
            .field("user_name", &self.credentials.user_name)
            .finish()
    }
}

impl ContainerUser {
    pub fn user_name_for(container_id: &str) -> String {
        format!("{USER_NAME_PREFIX}{container_id}")
    }

    /// Create `c_<id>` with a fresh random password
    pub fn create(manager: Arc<dyn UserManager>, container_id: &str, group: &str) -> Result<Self> {
        let user_name = Self::user_name_for(container_id);
        let password = generate_password();
        manager.create_user(&user_name, &password, group)?;
        Ok(Self {
            credentials: Credentials {
                user_name,
                password,
                domain: None,
            },
            manager,
            deleted: AtomicBool::new(false),
        })
    }

    /// Claim an existing account; the password is not recoverable
    pub fn restore(manager: Arc<dyn UserManager>, container_id: &str) -> Self {
        Self {
            credentials: Credentials {
                user_name: Self::user_name_for(container_id),
                password: String::new(),
                domain: None,
            },
            manager,
            deleted: AtomicBool::new(false),
        }
    }

    pub fn user_name(&self) -> &str {
        &self.credentials.user_name
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn sid(&self) -> Result<String> {
        self.manager.get_sid(&self.credentials.user_name)
    }

    pub fn create_profile(&self) -> Result<()> {
        self.manager
            .create_profile(&self.credentials.user_name, &self.credentials.password)
    }

    pub fn delete_profile(&self) -> Result<()> {
        self.manager.delete_profile(&self.credentials.user_name)
    }

    pub fn delete(&self) -> Result<()> {
        if self.deleted.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.manager.delete_user(&self.credentials.user_name) {
            self.deleted.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }
}

fn generate_password() -> String {
    let body: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect();
    // Satisfy complexity policies that want a symbol
    format!("{body}!")
}
