//! Provisioning run
//!
//! A run is a fixed sequence of convergent steps. Each step reports whether it
//! changed anything; the first failing step aborts the run and leaves earlier
//! steps' effects in place.

use std::{
    fmt,
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::aggregate::{aggregate, Aggregation};
use crate::auth::AuthPlan;
use crate::certs::ensure_certificate_bundle;
use crate::config::Config;
use crate::errors::ProvisionError;
use crate::inventory::InventorySearch;
use crate::logging::log_step;
use crate::render::{ConfigRenderer, ConfigTemplate, RenderedFile};
use crate::resources::{archive_matching, ensure_directory, remove_file, write_file, Ownership, PathSpec};
use crate::system::{run_guarded, CommandSpec, ServiceAction, SystemManager};

pub const WEB_SERVICE: &str = "apache2";
pub const WEB_PACKAGES: [&str; 1] = ["apache2"];
pub const OPENID_PACKAGE: &str = "libapache2-mod-auth-openid";
pub const WEB_MODULES: [&str; 2] = ["ssl", "rewrite"];
pub const SITE_NAME: &str = "nagios3.conf";
pub const DEFAULT_SITE: &str = "000-default";
pub const VENDOR_PATTERN: &str = "*_nagios*.cfg";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Changed,
    Unchanged,
    Skipped,
}

impl StepStatus {
    pub fn from_changed(changed: bool) -> Self {
        if changed {
            Self::Changed
        } else {
            Self::Unchanged
        }
    }

    pub fn is_changed(&self) -> bool {
        matches!(self, Self::Changed)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Changed => "changed",
            Self::Unchanged => "unchanged",
            Self::Skipped => "skipped",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    pub step: &'static str,
    pub status: StepStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvisionReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub steps: Vec<StepRecord>,
}

impl ProvisionReport {
    pub fn changed_steps(&self) -> Vec<&'static str> {
        self.steps
            .iter()
            .filter(|record| record.status.is_changed())
            .map(|record| record.step)
            .collect()
    }

    pub fn status_of(&self, step: &str) -> Option<StepStatus> {
        self.steps
            .iter()
            .find(|record| record.step == step)
            .map(|record| record.status)
    }
}

async fn record<F>(
    steps: &mut Vec<StepRecord>,
    step: &'static str,
    work: F,
) -> Result<StepStatus, ProvisionError>
where
    F: Future<Output = Result<StepStatus, ProvisionError>>,
{
    let status = log_step(step, work).await?;
    steps.push(StepRecord { step, status });
    Ok(status)
}

pub struct Provisioner {
    config: Config,
    search: Arc<dyn InventorySearch>,
    system: Arc<dyn SystemManager>,
    renderer: ConfigRenderer,
}

impl Provisioner {
    pub fn new(
        config: Config,
        search: Arc<dyn InventorySearch>,
        system: Arc<dyn SystemManager>,
    ) -> Result<Self, ProvisionError> {
        let renderer = ConfigRenderer::new(&config)?;
        Ok(Self {
            config,
            search,
            system,
            renderer,
        })
    }

    pub async fn aggregate(&self) -> Result<Aggregation, ProvisionError> {
        aggregate(self.search.as_ref(), &self.config).await
    }

    pub async fn run(&self) -> Result<ProvisionReport, ProvisionError> {
        let started_at = Utc::now();
        let aggregation = self.aggregate().await?;
        let auth = AuthPlan::for_config(&self.config);
        let mut steps = Vec::new();
        let mut nagios_changed = false;
        let mut web_reload = false;

        record(&mut steps, "install packages", self.install_packages()).await?;
        record(&mut steps, "start web server", self.start_service(WEB_SERVICE)).await?;
        web_reload |= record(&mut steps, "enable web modules", self.enable_modules(&WEB_MODULES))
            .await?
            .is_changed();

        nagios_changed |= record(
            &mut steps,
            "render nagios.cfg",
            self.write_config(ConfigTemplate::Nagios, &aggregation),
        )
        .await?
        .is_changed();

        record(&mut steps, "create directories", self.create_directories()).await?;
        record(&mut steps, "archive vendor definitions", self.archive_vendor_definitions()).await?;
        record(&mut steps, "remove vendor site", self.remove_vendor_site()).await?;

        match &auth {
            AuthPlan::EnableModule { module } => {
                web_reload |= record(&mut steps, "enable federated auth", self.enable_openid(module))
                    .await?
                    .is_changed();
            }
            AuthPlan::CredentialsFile { path } => {
                record(
                    &mut steps,
                    "render htpasswd.users",
                    self.write_credentials(path, &aggregation),
                )
                .await?;
            }
        }

        web_reload |= record(&mut steps, "disable default site", self.disable_default_site())
            .await?
            .is_changed();

        record(&mut steps, "certificates", self.ensure_certificates()).await?;
        // The site only needs a reload here when it was already being served.
        let site_enabled = self.enabled_site_path().symlink_metadata().is_ok();
        let site_changed = record(
            &mut steps,
            "render web site",
            self.write_config(ConfigTemplate::ApacheSite, &aggregation),
        )
        .await?
        .is_changed();
        web_reload |= site_changed && site_enabled;
        web_reload |= record(&mut steps, "enable web site", self.enable_site())
            .await?
            .is_changed();

        for template in ConfigTemplate::NAGIOS_FILES {
            nagios_changed |= record(
                &mut steps,
                render_step_name(template),
                self.write_config(template, &aggregation),
            )
            .await?
            .is_changed();
        }

        let started =
            record(&mut steps, "start nagios", self.start_service(&self.config.service_name))
                .await?
                .is_changed();

        // A service started by this run already reads the new configuration.
        record(
            &mut steps,
            "reload nagios",
            self.reload_if(&self.config.service_name, nagios_changed && !started),
        )
        .await?;
        record(
            &mut steps,
            "reload web server",
            self.reload_if(WEB_SERVICE, web_reload),
        )
        .await?;

        let report = ProvisionReport {
            started_at,
            finished_at: Utc::now(),
            steps,
        };
        info!(
            changed = report.changed_steps().len(),
            steps = report.steps.len(),
            "provisioning finished"
        );
        Ok(report)
    }

    /// Renders every managed file into `output` without touching the system.
    pub async fn render_to(&self, output: &Path) -> Result<Vec<PathBuf>, ProvisionError> {
        let aggregation = self.aggregate().await?;

        let mut files = self.renderer.render_nagios_configs(&aggregation)?;
        files.push(self.renderer.render_file(ConfigTemplate::ApacheSite, &aggregation)?);
        if AuthPlan::for_config(&self.config).writes_credentials() {
            files.push(self.renderer.render_file(ConfigTemplate::Htpasswd, &aggregation)?);
        }

        let mut written = Vec::with_capacity(files.len());
        for file in files {
            let path = output.join(file.template.name());
            write_file(
                &PathSpec::new(&path, file.template.mode(), Ownership::unmanaged()),
                &file.contents,
            )?;
            written.push(path);
        }

        info!(output = %output.display(), files = written.len(), "configuration rendered");
        Ok(written)
    }

    async fn install_packages(&self) -> Result<StepStatus, ProvisionError> {
        let mut changed = false;
        for package in WEB_PACKAGES
            .iter()
            .copied()
            .chain(self.config.packages.iter().map(String::as_str))
        {
            changed |= self.system.install_package(package).await?;
        }
        Ok(StepStatus::from_changed(changed))
    }

    async fn start_service(&self, unit: &str) -> Result<StepStatus, ProvisionError> {
        let enabled = self.system.service(unit, ServiceAction::Enable).await?;
        let started = self.system.service(unit, ServiceAction::Start).await?;
        Ok(StepStatus::from_changed(enabled || started))
    }

    async fn reload_if(&self, unit: &str, needed: bool) -> Result<StepStatus, ProvisionError> {
        if !needed {
            return Ok(StepStatus::Skipped);
        }
        self.system.service(unit, ServiceAction::Reload).await?;
        Ok(StepStatus::Changed)
    }

    async fn remove_vendor_site(&self) -> Result<StepStatus, ProvisionError> {
        let path = self.config.apache_dir.join("conf.d").join(SITE_NAME);
        Ok(StepStatus::from_changed(remove_file(&path)?))
    }

    async fn enable_openid(&self, module: &str) -> Result<StepStatus, ProvisionError> {
        let installed = self.system.install_package(OPENID_PACKAGE).await?;
        let enabled = self.enable_modules(&[module]).await?.is_changed();
        Ok(StepStatus::from_changed(installed || enabled))
    }

    async fn write_credentials(
        &self,
        path: &Path,
        aggregation: &Aggregation,
    ) -> Result<StepStatus, ProvisionError> {
        let file = self.renderer.render_file(ConfigTemplate::Htpasswd, aggregation)?;
        let spec = PathSpec::new(
            path,
            file.template.mode(),
            Ownership::new(self.config.owner(), self.config.web_user()),
        );
        Ok(StepStatus::from_changed(write_file(&spec, &file.contents)?))
    }

    async fn disable_default_site(&self) -> Result<StepStatus, ProvisionError> {
        let enabled = self
            .config
            .apache_dir
            .join("sites-enabled")
            .join(format!("{DEFAULT_SITE}.conf"));
        let command = CommandSpec::new("a2dissite")
            .arg(DEFAULT_SITE)
            .only_if_exists(enabled);
        Ok(StepStatus::from_changed(
            run_guarded(self.system.as_ref(), &command).await?,
        ))
    }

    async fn enable_site(&self) -> Result<StepStatus, ProvisionError> {
        let command = CommandSpec::new("a2ensite")
            .arg(SITE_NAME)
            .unless_exists(self.enabled_site_path());
        Ok(StepStatus::from_changed(
            run_guarded(self.system.as_ref(), &command).await?,
        ))
    }

    async fn enable_modules(&self, modules: &[&str]) -> Result<StepStatus, ProvisionError> {
        let mut changed = false;
        for module in modules {
            let command = CommandSpec::new("a2enmod").arg(*module).unless_exists(
                self.config
                    .apache_dir
                    .join("mods-enabled")
                    .join(format!("{module}.load")),
            );
            changed |= run_guarded(self.system.as_ref(), &command).await?;
        }
        Ok(StepStatus::from_changed(changed))
    }

    async fn create_directories(&self) -> Result<StepStatus, ProvisionError> {
        let config = &self.config;
        let nagios = Ownership::new(config.owner(), config.owner_group());
        let specs = [
            PathSpec::new(config.conf_dir.join("dist"), 0o755, nagios.clone()),
            PathSpec::new(&config.state_dir, 0o751, nagios),
            PathSpec::new(
                config.state_dir.join("rw"),
                0o2710,
                Ownership::new(config.owner(), config.web_user()),
            ),
        ];

        let mut changed = false;
        for spec in &specs {
            changed |= ensure_directory(spec)?;
        }
        Ok(StepStatus::from_changed(changed))
    }

    async fn archive_vendor_definitions(&self) -> Result<StepStatus, ProvisionError> {
        let archived = archive_matching(
            &self.config.config_dir,
            VENDOR_PATTERN,
            &self.config.conf_dir.join("dist"),
        )?;
        if archived.is_empty() {
            Ok(StepStatus::Skipped)
        } else {
            Ok(StepStatus::Changed)
        }
    }

    async fn ensure_certificates(&self) -> Result<StepStatus, ProvisionError> {
        let dir = self.config.certificate_dir();
        let web = Ownership::new(self.config.web_user(), self.config.web_user());
        let created_dir = ensure_directory(&PathSpec::new(&dir, 0o700, web))?;
        let generated =
            ensure_certificate_bundle(self.system.as_ref(), &dir, &self.config.ssl_req).await?;
        Ok(StepStatus::from_changed(created_dir || generated))
    }

    async fn write_config(
        &self,
        template: ConfigTemplate,
        aggregation: &Aggregation,
    ) -> Result<StepStatus, ProvisionError> {
        let file = self.renderer.render_file(template, aggregation)?;
        let changed = write_file(&self.spec_for(&file), &file.contents)?;
        Ok(StepStatus::from_changed(changed))
    }

    fn spec_for(&self, file: &RenderedFile) -> PathSpec {
        let ownership = match file.template {
            ConfigTemplate::ApacheSite => Ownership::unmanaged(),
            _ => Ownership::new(self.config.owner(), self.config.owner_group()),
        };
        PathSpec::new(&file.path, file.template.mode(), ownership)
    }

    fn enabled_site_path(&self) -> PathBuf {
        self.config.apache_dir.join("sites-enabled").join(SITE_NAME)
    }
}

fn render_step_name(template: ConfigTemplate) -> &'static str {
    match template {
        ConfigTemplate::Nagios => "render nagios.cfg",
        ConfigTemplate::Cgi => "render cgi.cfg",
        ConfigTemplate::Templates => "render templates.cfg",
        ConfigTemplate::Timeperiods => "render timeperiods.cfg",
        ConfigTemplate::Commands => "render commands.cfg",
        ConfigTemplate::Services => "render services.cfg",
        ConfigTemplate::Contacts => "render contacts.cfg",
        ConfigTemplate::Hostgroups => "render hostgroups.cfg",
        ConfigTemplate::Hosts => "render hosts.cfg",
        ConfigTemplate::Htpasswd => "render htpasswd.users",
        ConfigTemplate::ApacheSite => "render web site",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(steps: &[(&'static str, StepStatus)]) -> ProvisionReport {
        let now = Utc::now();
        ProvisionReport {
            started_at: now,
            finished_at: now,
            steps: steps
                .iter()
                .map(|&(step, status)| StepRecord { step, status })
                .collect(),
        }
    }

    #[test]
    fn report_lists_changed_steps_in_order() {
        let report = report(&[
            ("install packages", StepStatus::Changed),
            ("render hosts.cfg", StepStatus::Unchanged),
            ("reload nagios", StepStatus::Skipped),
            ("reload web server", StepStatus::Changed),
        ]);

        assert_eq!(report.changed_steps(), vec!["install packages", "reload web server"]);
        assert_eq!(report.status_of("reload nagios"), Some(StepStatus::Skipped));
        assert_eq!(report.status_of("render cgi.cfg"), None);
    }

    #[test]
    fn step_status_serializes_lowercase() {
        let json = serde_json::to_value(report(&[("certificates", StepStatus::Unchanged)]))
            .expect("report serializes");
        assert_eq!(json["steps"][0]["status"], "unchanged");
        assert_eq!(StepStatus::from_changed(true).to_string(), "changed");
    }
}
