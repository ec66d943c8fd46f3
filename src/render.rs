//! Configuration rendering
//!
//! Every managed file is a Tera template. Defaults are compiled into the
//! binary; a file named `<template>.tera` in the configured template
//! directory replaces the default of the same name.

use std::path::PathBuf;

use serde::Serialize;
use tera::{Context, Tera};
use tracing::{debug, info};

use crate::aggregate::Aggregation;
use crate::auth::AuthMethod;
use crate::certs::CertificatePaths;
use crate::config::Config;
use crate::errors::ProvisionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigTemplate {
    Nagios,
    Cgi,
    Templates,
    Timeperiods,
    Commands,
    Services,
    Contacts,
    Hostgroups,
    Hosts,
    Htpasswd,
    ApacheSite,
}

impl ConfigTemplate {
    pub const ALL: [ConfigTemplate; 11] = [
        Self::Nagios,
        Self::Cgi,
        Self::Templates,
        Self::Timeperiods,
        Self::Commands,
        Self::Services,
        Self::Contacts,
        Self::Hostgroups,
        Self::Hosts,
        Self::Htpasswd,
        Self::ApacheSite,
    ];

    /// Files that make up the Nagios configuration proper, in render order.
    pub const NAGIOS_FILES: [ConfigTemplate; 8] = [
        Self::Cgi,
        Self::Templates,
        Self::Timeperiods,
        Self::Commands,
        Self::Services,
        Self::Contacts,
        Self::Hostgroups,
        Self::Hosts,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Nagios => "nagios.cfg",
            Self::Cgi => "cgi.cfg",
            Self::Templates => "templates.cfg",
            Self::Timeperiods => "timeperiods.cfg",
            Self::Commands => "commands.cfg",
            Self::Services => "services.cfg",
            Self::Contacts => "contacts.cfg",
            Self::Hostgroups => "hostgroups.cfg",
            Self::Hosts => "hosts.cfg",
            Self::Htpasswd => "htpasswd.users",
            Self::ApacheSite => "apache2.conf",
        }
    }

    fn embedded(&self) -> &'static str {
        match self {
            Self::Nagios => include_str!("templates/nagios.cfg.tera"),
            Self::Cgi => include_str!("templates/cgi.cfg.tera"),
            Self::Templates => include_str!("templates/templates.cfg.tera"),
            Self::Timeperiods => include_str!("templates/timeperiods.cfg.tera"),
            Self::Commands => include_str!("templates/commands.cfg.tera"),
            Self::Services => include_str!("templates/services.cfg.tera"),
            Self::Contacts => include_str!("templates/contacts.cfg.tera"),
            Self::Hostgroups => include_str!("templates/hostgroups.cfg.tera"),
            Self::Hosts => include_str!("templates/hosts.cfg.tera"),
            Self::Htpasswd => include_str!("templates/htpasswd.users.tera"),
            Self::ApacheSite => include_str!("templates/apache2.conf.tera"),
        }
    }

    /// Where the rendered file lives on the monitoring server.
    pub fn destination(&self, config: &Config) -> PathBuf {
        match self {
            Self::Nagios | Self::Cgi | Self::Htpasswd => config.conf_dir.join(self.name()),
            Self::ApacheSite => config.apache_dir.join("sites-available/nagios3.conf"),
            _ => config.config_dir.join(self.name()),
        }
    }

    pub fn mode(&self) -> u32 {
        match self {
            Self::Htpasswd => 0o640,
            _ => 0o644,
        }
    }
}

/// Settings every template can reach as `nagios.*`.
#[derive(Debug, Clone, Serialize)]
struct TemplateSettings {
    conf_dir: String,
    config_dir: String,
    state_dir: String,
    log_dir: String,
    cache_dir: String,
    docroot: String,
    user: String,
    group: String,
    service_name: String,
    sysadmin_email: String,
    notifications_enabled: bool,
    interval_length: u32,
    host_check_interval: u32,
    host_retry_interval: u32,
    service_check_interval: u32,
    service_retry_interval: u32,
    notification_interval: u32,
}

impl TemplateSettings {
    fn from_config(config: &Config) -> Self {
        // Intervals below are seconds expressed in `interval_length` units.
        let units = |seconds: u32| (seconds / config.interval_length).max(1);
        Self {
            conf_dir: config.conf_dir.display().to_string(),
            config_dir: config.config_dir.display().to_string(),
            state_dir: config.state_dir.display().to_string(),
            log_dir: config.log_dir.display().to_string(),
            cache_dir: config.cache_dir.display().to_string(),
            docroot: config.docroot.display().to_string(),
            user: config.user.clone(),
            group: config.group.clone(),
            service_name: config.service_name.clone(),
            sysadmin_email: config.sysadmin_email.clone(),
            notifications_enabled: config.notifications_enabled,
            interval_length: config.interval_length,
            host_check_interval: units(15),
            host_retry_interval: units(15),
            service_check_interval: units(60),
            service_retry_interval: units(15),
            notification_interval: units(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFile {
    pub template: ConfigTemplate,
    pub path: PathBuf,
    pub contents: String,
}

pub struct ConfigRenderer {
    tera: Tera,
    config: Config,
    settings: TemplateSettings,
}

impl ConfigRenderer {
    pub fn new(config: &Config) -> Result<Self, ProvisionError> {
        let mut tera = Tera::default();
        for template in ConfigTemplate::ALL {
            let source = match &config.template_dir {
                Some(dir) => {
                    let path = dir.join(format!("{}.tera", template.name()));
                    if path.is_file() {
                        debug!(template = template.name(), path = %path.display(), "using template override");
                        std::fs::read_to_string(&path).map_err(|err| {
                            ProvisionError::io("failed to read template", &path, err)
                        })?
                    } else {
                        template.embedded().to_string()
                    }
                }
                None => template.embedded().to_string(),
            };

            tera.add_raw_template(template.name(), &source)
                .map_err(|err| template_error(template, &err))?;
        }

        Ok(Self {
            tera,
            config: config.clone(),
            settings: TemplateSettings::from_config(config),
        })
    }

    /// Renders one template with `variables` on top of the shared settings.
    pub fn render(
        &self,
        template: ConfigTemplate,
        variables: &Context,
    ) -> Result<String, ProvisionError> {
        let mut context = Context::new();
        context.insert("nagios", &self.settings);
        context.extend(variables.clone());

        self.tera
            .render(template.name(), &context)
            .map_err(|err| template_error(template, &err))
    }

    pub fn render_file(
        &self,
        template: ConfigTemplate,
        aggregation: &Aggregation,
    ) -> Result<RenderedFile, ProvisionError> {
        let variables = self.variables_for(template, aggregation);
        let contents = self.render(template, &variables)?;
        debug!(template = template.name(), bytes = contents.len(), "template rendered");

        Ok(RenderedFile {
            template,
            path: template.destination(&self.config),
            contents,
        })
    }

    /// Renders `nagios.cfg` and every object/CGI file.
    pub fn render_nagios_configs(
        &self,
        aggregation: &Aggregation,
    ) -> Result<Vec<RenderedFile>, ProvisionError> {
        let files = std::iter::once(ConfigTemplate::Nagios)
            .chain(ConfigTemplate::NAGIOS_FILES)
            .map(|template| self.render_file(template, aggregation))
            .collect::<Result<Vec<_>, _>>()?;
        info!(files = files.len(), "nagios configuration rendered");
        Ok(files)
    }

    pub fn variables_for(&self, template: ConfigTemplate, aggregation: &Aggregation) -> Context {
        let mut context = Context::new();
        match template {
            ConfigTemplate::Nagios | ConfigTemplate::Templates | ConfigTemplate::Timeperiods => {}
            ConfigTemplate::Cgi => {
                let authorized = if aggregation.members.is_empty() {
                    "*".to_string()
                } else {
                    aggregation.members.join(",")
                };
                context.insert("authorized_users", &authorized);
            }
            ConfigTemplate::Commands => {
                context.insert("services", &aggregation.services);
                context.insert("eventhandlers", &aggregation.eventhandlers);
            }
            ConfigTemplate::Services => {
                context.insert("service_hosts", &aggregation.service_hosts);
                context.insert("services", &aggregation.services);
            }
            ConfigTemplate::Contacts => {
                context.insert("admins", &aggregation.sysadmins);
                context.insert("members", &aggregation.members);
            }
            ConfigTemplate::Hostgroups => {
                context.insert("roles", &aggregation.roles);
                context.insert("environments", &aggregation.environments);
                context.insert("os", &aggregation.os_list);
                context.insert("hostgroups", &aggregation.hostgroups);
                context.insert("hostgroup_members", &aggregation.hostgroup_members());
            }
            ConfigTemplate::Hosts => {
                context.insert("nodes", &aggregation.nodes);
            }
            ConfigTemplate::Htpasswd => {
                context.insert("sysadmins", &aggregation.sysadmins);
            }
            ConfigTemplate::ApacheSite => {
                let certificates = CertificatePaths::in_dir(&self.config.certificate_dir());
                let server_name = match &aggregation.public_domain {
                    Some(domain) => format!("nagios.{domain}"),
                    None => self
                        .config
                        .local_node
                        .fqdn
                        .clone()
                        .unwrap_or_else(|| self.config.local_node.hostname.clone()),
                };
                let auth_method = match self.config.auth_method {
                    AuthMethod::OpenId => "openid",
                    AuthMethod::Htpasswd => "htpasswd",
                };
                context.insert("public_domain", &aggregation.public_domain);
                context.insert("server_name", &server_name);
                context.insert("auth_method", auth_method);
                context.insert("certificate", &certificates.certificate.display().to_string());
                context.insert("key", &certificates.key.display().to_string());
            }
        }
        context
    }
}

fn template_error(template: ConfigTemplate, err: &tera::Error) -> ProvisionError {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }

    ProvisionError::Template {
        template: template.name().to_string(),
        message,
    }
}
