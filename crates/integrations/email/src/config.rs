use serde::{Deserialize, Serialize};

/// Which mail transport to build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailBackendKind {
    #[default]
    Smtp,
    /// Record and log only. Nothing leaves the process.
    Memory,
}

fn default_from() -> String {
    "noreply@localhost".to_owned()
}

fn default_smtp_host() -> String {
    "localhost".to_owned()
}

fn default_smtp_port() -> u16 {
    587
}

fn default_tls() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    10
}

/// Email transport settings.
///
/// # Examples
///
/// ```
/// use meter_email::EmailConfig;
///
/// let config = EmailConfig::new("smtp.example.com", "usage@example.com");
/// assert_eq!(config.smtp_port, 587);
/// assert!(config.tls);
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default = "default_from")]
    pub from_address: String,

    #[serde(default)]
    pub backend: EmailBackendKind,

    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,

    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,

    pub username: Option<String>,

    pub password: Option<String>,

    /// STARTTLS. Defaults to `true`.
    #[serde(default = "default_tls")]
    pub tls: bool,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            from_address: default_from(),
            backend: EmailBackendKind::default(),
            smtp_host: default_smtp_host(),
            smtp_port: default_smtp_port(),
            username: None,
            password: None,
            tls: default_tls(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl std::fmt::Debug for EmailConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailConfig")
            .field("from_address", &self.from_address)
            .field("backend", &self.backend)
            .field("smtp_host", &self.smtp_host)
            .field("smtp_port", &self.smtp_port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("tls", &self.tls)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl EmailConfig {
    pub fn new(smtp_host: impl Into<String>, from_address: impl Into<String>) -> Self {
        Self {
            smtp_host: smtp_host.into(),
            from_address: from_address.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.smtp_port = port;
        self
    }

    #[must_use]
    pub fn without_tls(mut self) -> Self {
        self.tls = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_uses_defaults() {
        let config: EmailConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.backend, EmailBackendKind::Smtp);
        assert_eq!(config.smtp_port, 587);
        assert_eq!(config.timeout_secs, 10);
        assert!(config.password.is_none());
    }

    #[test]
    fn backend_kind_is_snake_case() {
        let config: EmailConfig = serde_json::from_str(r#"{"backend": "memory"}"#).unwrap();
        assert_eq!(config.backend, EmailBackendKind::Memory);
    }

    #[test]
    fn debug_redacts_password() {
        let config = EmailConfig::new("smtp.example.com", "a@example.com")
            .with_credentials("user", "hunter2-placeholder");
        let debug = format!("{config:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("hunter2-placeholder"));
    }
}
