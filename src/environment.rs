//! Process environment blocks with Windows key semantics

use std::collections::HashMap;

/// Variables describing the host machine that a container must not inherit
pub const FORBIDDEN_VARIABLES: &[&str] = &[
    "ALLUSERSPROFILE",
    "COMPUTERNAME",
    "FP_NO_HOST_CHECK",
    "GOPATH",
    "NUMBER_OF_PROCESSORS",
    "OS",
    "PATHEXT",
    "PROCESSOR_ARCHITECTURE",
    "PROCESSOR_IDENTIFIER",
    "PROCESSOR_LEVEL",
    "PROCESSOR_REVISION",
    "PSModulePath",
    "PUBLIC",
    "SystemDrive",
    "USERDOMAIN",
    "VS110COMNTOOLS",
    "VS120COMNTOOLS",
    "WIX",
];

/// Environment variables keyed case-insensitively; a key keeps the spelling it
/// was last written with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentBlock {
    entries: HashMap<String, (String, String)>,
}

impl EnvironmentBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// The machine's default block minus [`FORBIDDEN_VARIABLES`]
    pub fn system_default() -> crate::Result<Self> {
        let mut block: Self = system_variables()?.into_iter().collect();
        for name in FORBIDDEN_VARIABLES {
            block.remove(name);
        }
        Ok(block)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_lowercase())
            .map(|(_, value)| value.as_str())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.entries.insert(key.to_lowercase(), (key, value.into()));
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(&key.to_lowercase()).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Overlay `overrides` onto this block; the override value wins
    pub fn merge<'a, I>(mut self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (key, value) in overrides {
            self.set(key.clone(), value.clone());
        }
        self
    }

    pub fn to_map(&self) -> HashMap<String, String> {
        self.entries.values().cloned().collect()
    }
}

impl FromIterator<(String, String)> for EnvironmentBlock {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut block = Self::new();
        for (key, value) in iter {
            block.set(key, value);
        }
        block
    }
}

impl From<HashMap<String, String>> for EnvironmentBlock {
    fn from(map: HashMap<String, String>) -> Self {
        map.into_iter().collect()
    }
}

#[cfg(windows)]
fn system_variables() -> crate::Result<Vec<(String, String)>> {
    use std::ffi::c_void;
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::System::Environment::{CreateEnvironmentBlock, DestroyEnvironmentBlock};

    let mut block: *mut c_void = std::ptr::null_mut();
    unsafe {
        CreateEnvironmentBlock(&mut block, HANDLE::default(), false)
            .map_err(|e| crate::Error::win32("CreateEnvironmentBlock", e))?;
        let vars = parse_wide_block(block as *const u16);
        let _ = DestroyEnvironmentBlock(block);
        Ok(vars)
    }
}

/// Parse a double-NUL terminated `KEY=VALUE` UTF-16 block
#[cfg(windows)]
pub(crate) unsafe fn parse_wide_block(mut cursor: *const u16) -> Vec<(String, String)> {
    let mut vars = Vec::new();
    loop {
        let mut len = 0;
        while *cursor.add(len) != 0 {
            len += 1;
        }
        if len == 0 {
            break;
        }
        let entry = String::from_utf16_lossy(std::slice::from_raw_parts(cursor, len));
        // Entries such as "=C:=C:\" describe per-drive directories
        if let Some((split, _)) = entry.char_indices().skip(1).find(|(_, c)| *c == '=') {
            vars.push((entry[..split].to_string(), entry[split + 1..].to_string()));
        }
        cursor = cursor.add(len + 1);
    }
    vars
}

#[cfg(not(windows))]
fn system_variables() -> crate::Result<Vec<(String, String)>> {
    Ok(std::env::vars().collect())
}
