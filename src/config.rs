use std::{env, path::PathBuf};

use thiserror::Error;

use crate::auth::AuthMethod;
use crate::inventory::model::Node;
use crate::system::PackageManager;

const DEFAULT_PACKAGES: [&str; 3] = ["nagios3", "nagios-nrpe-plugin", "nagios-images"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InventorySource {
    Http { url: String, token: Option<String> },
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub inventory: InventorySource,
    pub local_node: Node,
    pub domain: Option<String>,
    pub public_domain: Option<String>,
    pub multi_environment: bool,
    pub multi_os: bool,
    pub users_group: String,
    pub auth_method: AuthMethod,
    pub conf_dir: PathBuf,
    pub config_dir: PathBuf,
    pub state_dir: PathBuf,
    pub log_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub docroot: PathBuf,
    pub user: String,
    pub group: String,
    pub apache_dir: PathBuf,
    pub apache_user: String,
    pub service_name: String,
    pub packages: Vec<String>,
    pub package_manager: PackageManager,
    pub ssl_req: String,
    pub template_dir: Option<PathBuf>,
    pub manage_ownership: bool,
    pub notifications_enabled: bool,
    pub sysadmin_email: String,
    pub interval_length: u32,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("one of NAGIOS_INVENTORY_URL or NAGIOS_INVENTORY_FILE is required")]
    MissingInventorySource,
    #[error("NAGIOS_INVENTORY_URL and NAGIOS_INVENTORY_FILE are mutually exclusive")]
    ConflictingInventorySource,
    #[error("{key} must be a boolean (true/false, yes/no, on/off, 1/0), got `{value}`")]
    InvalidBool { key: &'static str, value: String },
    #[error("{key} must be a positive integer, got `{value}`")]
    InvalidNumber { key: &'static str, value: String },
    #[error("NAGIOS_INSTALL_METHOD `{0}` is not supported, only `package` is")]
    UnsupportedInstallMethod(String),
    #[error("NAGIOS_PACKAGE_MANAGER `{0}` is not supported")]
    UnsupportedPackageManager(String),
    #[error("could not determine the local node name, set NAGIOS_NODE_NAME")]
    MissingNodeName,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let inventory = match (get("NAGIOS_INVENTORY_URL"), get("NAGIOS_INVENTORY_FILE")) {
            (Some(url), None) => InventorySource::Http {
                url: url.trim_end_matches('/').to_string(),
                token: get("NAGIOS_INVENTORY_TOKEN"),
            },
            (None, Some(path)) => InventorySource::File(PathBuf::from(path)),
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingInventorySource),
            (None, None) => return Err(ConfigError::MissingInventorySource),
        };

        let environment = get("NAGIOS_ENVIRONMENT").unwrap_or_else(|| "_default".to_string());
        let name = match get("NAGIOS_NODE_NAME") {
            Some(name) => name,
            None => system_hostname().ok_or(ConfigError::MissingNodeName)?,
        };
        let local_node = Node {
            hostname: get("NAGIOS_NODE_HOSTNAME").unwrap_or_else(|| name.clone()),
            fqdn: get("NAGIOS_NODE_FQDN"),
            ipaddress: get("NAGIOS_NODE_IPADDRESS"),
            os: get("NAGIOS_NODE_OS").unwrap_or_else(|| "linux".to_string()),
            environment,
            roles: get("NAGIOS_NODE_ROLES")
                .map(|roles| split_list(&roles))
                .unwrap_or_default(),
            name,
        };

        // Only distribution packages are supported.
        if let Some(method) = get("NAGIOS_INSTALL_METHOD").filter(|method| method != "package") {
            return Err(ConfigError::UnsupportedInstallMethod(method));
        }
        let package_manager = match get("NAGIOS_PACKAGE_MANAGER") {
            None => PackageManager::Apt,
            Some(value) => PackageManager::parse(&value)
                .ok_or(ConfigError::UnsupportedPackageManager(value))?,
        };

        let conf_dir = PathBuf::from(
            get("NAGIOS_CONF_DIR").unwrap_or_else(|| "/etc/nagios3".to_string()),
        );
        let config_dir = get("NAGIOS_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| conf_dir.join("conf.d"));

        let subject_host = local_node
            .fqdn
            .clone()
            .unwrap_or_else(|| local_node.hostname.clone());
        let ssl_req = get("NAGIOS_SSL_REQ").unwrap_or_else(|| {
            format!(
                "/C=US/ST=Several/L=Locality/O=Example/OU=Operations/CN={subject_host}/emailAddress=ops@{subject_host}"
            )
        });

        let interval_length = match get("NAGIOS_INTERVAL_LENGTH") {
            None => 1,
            Some(value) => value
                .parse::<u32>()
                .ok()
                .filter(|parsed| *parsed > 0)
                .ok_or(ConfigError::InvalidNumber {
                    key: "NAGIOS_INTERVAL_LENGTH",
                    value,
                })?,
        };

        Ok(Self {
            inventory,
            local_node,
            domain: get("NAGIOS_DOMAIN"),
            public_domain: get("NAGIOS_PUBLIC_DOMAIN"),
            multi_environment: flag(get("NAGIOS_MULTI_ENVIRONMENT"), "NAGIOS_MULTI_ENVIRONMENT", false)?,
            multi_os: flag(get("NAGIOS_MULTI_OS"), "NAGIOS_MULTI_OS", false)?,
            users_group: get("NAGIOS_USERS_GROUP").unwrap_or_else(|| "sysadmin".to_string()),
            auth_method: AuthMethod::parse(
                get("NAGIOS_AUTH_METHOD").as_deref().unwrap_or("openid"),
            ),
            conf_dir,
            config_dir,
            state_dir: path_or(get("NAGIOS_STATE_DIR"), "/var/lib/nagios3"),
            log_dir: path_or(get("NAGIOS_LOG_DIR"), "/var/log/nagios3"),
            cache_dir: path_or(get("NAGIOS_CACHE_DIR"), "/var/cache/nagios3"),
            docroot: path_or(get("NAGIOS_DOCROOT"), "/usr/share/nagios3/htdocs"),
            user: get("NAGIOS_USER").unwrap_or_else(|| "nagios".to_string()),
            group: get("NAGIOS_GROUP").unwrap_or_else(|| "nagios".to_string()),
            apache_dir: path_or(get("NAGIOS_APACHE_DIR"), "/etc/apache2"),
            apache_user: get("NAGIOS_APACHE_USER").unwrap_or_else(|| "www-data".to_string()),
            service_name: get("NAGIOS_SERVICE_NAME").unwrap_or_else(|| "nagios3".to_string()),
            packages: get("NAGIOS_PACKAGES")
                .map(|packages| split_list(&packages))
                .unwrap_or_else(|| DEFAULT_PACKAGES.iter().map(|p| p.to_string()).collect()),
            package_manager,
            ssl_req,
            template_dir: get("NAGIOS_TEMPLATE_DIR").map(PathBuf::from),
            manage_ownership: flag(get("NAGIOS_MANAGE_OWNERSHIP"), "NAGIOS_MANAGE_OWNERSHIP", true)?,
            notifications_enabled: flag(
                get("NAGIOS_NOTIFICATIONS_ENABLED"),
                "NAGIOS_NOTIFICATIONS_ENABLED",
                false,
            )?,
            sysadmin_email: get("NAGIOS_SYSADMIN_EMAIL")
                .unwrap_or_else(|| "root@localhost".to_string()),
            interval_length,
        })
    }

    /// Domain the web front end is published under.
    pub fn effective_public_domain(&self) -> Option<&str> {
        self.public_domain.as_deref().or(self.domain.as_deref())
    }

    pub fn certificate_dir(&self) -> PathBuf {
        self.conf_dir.join("certificates")
    }

    pub fn owner(&self) -> Option<&str> {
        self.manage_ownership.then_some(self.user.as_str())
    }

    pub fn owner_group(&self) -> Option<&str> {
        self.manage_ownership.then_some(self.group.as_str())
    }

    pub fn web_user(&self) -> Option<&str> {
        self.manage_ownership.then_some(self.apache_user.as_str())
    }
}

fn flag(value: Option<String>, key: &'static str, default: bool) -> Result<bool, ConfigError> {
    let Some(value) = value else {
        return Ok(default);
    };

    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool { key, value }),
    }
}

fn path_or(value: Option<String>, default: &str) -> PathBuf {
    PathBuf::from(value.unwrap_or_else(|| default.to_string()))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn system_hostname() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
}
