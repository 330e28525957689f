//! Configuration type definitions.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transfer::BulkCopyOptions;

/// Login timeout used when none (or zero) is configured.
pub const DEFAULT_LOGIN_TIMEOUT_SECS: u64 = 15;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server connection properties.
    pub connection: ConnectionProperties,

    /// Bulk copy behavior.
    #[serde(default)]
    pub bulk_copy: BulkCopyOptions,
}

/// Connection properties for one SQL Server endpoint.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProperties {
    /// Server host name or address.
    pub host: String,

    /// TCP port (default: 1433). Ignored when `instance_name` is set.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Named instance, resolved through the SQL Browser service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,

    /// Database to open after login. Empty means the login's default.
    #[serde(default)]
    pub database: String,

    /// SQL authentication user.
    #[serde(default)]
    pub user: String,

    /// SQL authentication password.
    #[serde(default)]
    pub password: String,

    /// Encrypt the connection (default: true).
    #[serde(default = "default_true")]
    pub encrypt: bool,

    /// Accept the server certificate without validation (default: false).
    #[serde(default)]
    pub trust_server_certificate: bool,

    /// Host name expected in the server certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_name_in_certificate: Option<String>,

    /// CA certificate file used to validate the server certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_store: Option<String>,

    /// Login timeout budget in seconds (default: 15, 0 means default).
    #[serde(default = "default_login_timeout")]
    pub login_timeout_secs: u64,

    /// Mirror partner tried once when the primary is unreachable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failover_partner: Option<String>,

    /// Connect to all IPs of an availability group listener in parallel.
    #[serde(default)]
    pub multi_subnet_failover: bool,

    /// TDS packet size in bytes (default: 8000).
    #[serde(default = "default_packet_size")]
    pub packet_size: u32,

    /// Application name reported to the server.
    #[serde(default = "default_application_name")]
    pub application_name: String,
}

impl ConnectionProperties {
    /// Properties for `host` with everything else defaulted.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            instance_name: None,
            database: String::new(),
            user: String::new(),
            password: String::new(),
            encrypt: true,
            trust_server_certificate: false,
            host_name_in_certificate: None,
            trust_store: None,
            login_timeout_secs: default_login_timeout(),
            failover_partner: None,
            multi_subnet_failover: false,
            packet_size: default_packet_size(),
            application_name: default_application_name(),
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn with_login(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn with_login_timeout(mut self, secs: u64) -> Self {
        self.login_timeout_secs = secs;
        self
    }

    pub fn with_failover_partner(mut self, partner: impl Into<String>) -> Self {
        self.failover_partner = Some(partner.into());
        self
    }

    /// Effective login budget.
    pub fn login_timeout(&self) -> Duration {
        match self.login_timeout_secs {
            0 => Duration::from_secs(DEFAULT_LOGIN_TIMEOUT_SECS),
            secs => Duration::from_secs(secs),
        }
    }

    /// Copy of these properties aimed at the failover partner, if any.
    ///
    /// The partner may be written `host\instance` or `host,port`.
    pub fn for_failover_partner(&self) -> Option<Self> {
        let partner = self.failover_partner.as_deref()?.trim();
        if partner.is_empty() {
            return None;
        }
        let mut props = self.clone();
        props.failover_partner = None;
        if let Some((host, instance)) = partner.split_once('\\') {
            props.host = host.to_string();
            props.instance_name = Some(instance.to_string());
        } else if let Some((host, port)) = partner.split_once(',') {
            props.host = host.to_string();
            props.instance_name = None;
            props.port = port.trim().parse().unwrap_or(self.port);
        } else {
            props.host = partner.to_string();
            props.instance_name = None;
        }
        Some(props)
    }

    /// `host\instance` or `host,port` for logs and messages.
    pub fn server_display(&self) -> String {
        match &self.instance_name {
            Some(instance) => format!("{}\\{}", self.host, instance),
            None => format!("{},{}", self.host, self.port),
        }
    }
}

impl fmt::Debug for ConnectionProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProperties")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("instance_name", &self.instance_name)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("encrypt", &self.encrypt)
            .field("trust_server_certificate", &self.trust_server_certificate)
            .field("host_name_in_certificate", &self.host_name_in_certificate)
            .field("trust_store", &self.trust_store)
            .field("login_timeout_secs", &self.login_timeout_secs)
            .field("failover_partner", &self.failover_partner)
            .field("multi_subnet_failover", &self.multi_subnet_failover)
            .field("packet_size", &self.packet_size)
            .field("application_name", &self.application_name)
            .finish()
    }
}

fn default_port() -> u16 {
    1433
}

fn default_true() -> bool {
    true
}

fn default_login_timeout() -> u64 {
    DEFAULT_LOGIN_TIMEOUT_SECS
}

fn default_packet_size() -> u32 {
    8000
}

fn default_application_name() -> String {
    "mssql-bulk-load".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_password() {
        let props = ConnectionProperties::new("db").with_login("sa", "hunter2");
        let debug = format!("{:?}", props);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_zero_login_timeout_uses_default() {
        let props = ConnectionProperties::new("db").with_login_timeout(0);
        assert_eq!(props.login_timeout(), Duration::from_secs(15));
        let props = props.with_login_timeout(3);
        assert_eq!(props.login_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_failover_partner_forms() {
        let base = ConnectionProperties::new("primary");

        let p = base
            .clone()
            .with_failover_partner("mirror\\inst")
            .for_failover_partner()
            .unwrap();
        assert_eq!(p.host, "mirror");
        assert_eq!(p.instance_name.as_deref(), Some("inst"));
        assert!(p.failover_partner.is_none());

        let p = base
            .clone()
            .with_failover_partner("mirror,14330")
            .for_failover_partner()
            .unwrap();
        assert_eq!(p.port, 14330);

        assert!(base.for_failover_partner().is_none());
    }

    #[test]
    fn test_yaml_defaults() {
        let yaml = "connection:\n  host: localhost\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.connection.port, 1433);
        assert!(config.connection.encrypt);
        assert_eq!(config.connection.packet_size, 8000);
        assert_eq!(config.bulk_copy, BulkCopyOptions::default());
    }
}
