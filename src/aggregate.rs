//! Aggregation of inventory search results
//!
//! Builds the per-run [`Aggregation`] handed to the renderer. Every derived
//! collection is computed here from explicit search results; nothing is kept
//! between runs.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::errors::ProvisionError;
use crate::inventory::model::{
    Environment, EventHandlerDefinition, FromRecord, HostName, HostgroupDefinition, Node, Role,
    ServiceDefinition, Sysadmin,
};
use crate::inventory::{InventorySearch, Record, SearchError, SearchIndex, SearchQuery};

pub const SERVICES_DATA_BAG: &str = "nagios_services";
pub const EVENTHANDLERS_DATA_BAG: &str = "nagios_eventhandlers";
pub const HOSTGROUPS_DATA_BAG: &str = "nagios_hostgroups";

/// Hostgroup name to the hostnames it contains.
pub type HostMap = BTreeMap<String, BTreeSet<String>>;

/// Result of a search whose source is allowed to be missing.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome<T> {
    Found(Vec<T>),
    Unavailable { reason: String },
}

impl<T> SearchOutcome<T> {
    /// Collection to use downstream; unavailable sources become empty.
    pub fn into_collection(self, source: &str) -> Vec<T> {
        match self {
            Self::Found(items) => {
                if items.is_empty() {
                    info!(source, "no records returned from search");
                }
                items
            }
            Self::Unavailable { reason } => {
                info!(source, %reason, "search failed, continuing without it");
                Vec::new()
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct Aggregation {
    pub nodes: Vec<Node>,
    pub sysadmins: Vec<Sysadmin>,
    pub members: Vec<String>,
    pub os_list: Vec<String>,
    pub os_hosts: HostMap,
    pub roles: Vec<String>,
    pub environments: Vec<String>,
    pub service_hosts: HostMap,
    pub services: Vec<ServiceDefinition>,
    pub eventhandlers: Vec<EventHandlerDefinition>,
    pub hostgroups: Vec<String>,
    pub hostgroup_hosts: HostMap,
    pub public_domain: Option<String>,
}

impl Aggregation {
    /// Every hostgroup the configuration defines, with its members.
    ///
    /// Roles, environments, operating systems and search-defined hostgroups
    /// share one namespace; members of equally named groups are merged.
    pub fn hostgroup_members(&self) -> HostMap {
        let mut merged = HostMap::new();
        let names = self
            .roles
            .iter()
            .chain(&self.environments)
            .chain(&self.os_list)
            .chain(&self.hostgroups);
        for name in names {
            merged.entry(name.clone()).or_default();
        }
        for map in [&self.service_hosts, &self.os_hosts, &self.hostgroup_hosts] {
            for (name, hosts) in map {
                merged
                    .entry(name.clone())
                    .or_default()
                    .extend(hosts.iter().cloned());
            }
        }
        merged
    }
}

pub async fn aggregate(
    search: &dyn InventorySearch,
    config: &Config,
) -> Result<Aggregation, ProvisionError> {
    let sysadmins: Vec<Sysadmin> =
        search_records(search, &SearchQuery::users_in_group(&config.users_group)).await?;
    let members = sysadmins.iter().map(|admin| admin.id.clone()).collect();

    let found: Vec<Node> = search_records(search, &node_query(config)).await?;
    let nodes = effective_nodes(found, &config.local_node);

    let os_list = distinct_os(&nodes, config.multi_os);
    let os_hosts = os_hosts(&nodes, config.multi_os);

    let services = search_optional::<ServiceDefinition>(search, &SearchQuery::data_bag(SERVICES_DATA_BAG))
        .await?
        .into_collection(SERVICES_DATA_BAG);
    let eventhandlers =
        search_optional::<EventHandlerDefinition>(search, &SearchQuery::data_bag(EVENTHANDLERS_DATA_BAG))
            .await?
            .into_collection(EVENTHANDLERS_DATA_BAG);

    // Items sharing a hostgroup name contribute to one group.
    let mut hostgroups = Vec::new();
    let mut hostgroup_hosts = HostMap::new();
    for (name, hosts) in load_hostgroups(search, config)
        .await?
        .into_collection(HOSTGROUPS_DATA_BAG)
    {
        if !hostgroup_hosts.contains_key(&name) {
            hostgroups.push(name.clone());
        }
        hostgroup_hosts.entry(name).or_default().extend(hosts);
    }

    let mut service_hosts = HostMap::new();
    let roles: Vec<Role> = search_records(search, &SearchQuery::all(SearchIndex::Role)).await?;
    for role in &roles {
        let query = scoped(SearchQuery::nodes_with_role(&role.name), config);
        let hosts: Vec<HostName> = search_records(search, &query).await?;
        service_hosts
            .entry(role.name.clone())
            .or_default()
            .extend(hosts.into_iter().map(|host| host.0));
    }

    let mut environments = Vec::new();
    if config.multi_environment {
        let found: Vec<Environment> =
            search_records(search, &SearchQuery::all(SearchIndex::Environment)).await?;
        for environment in found {
            let query = SearchQuery::nodes_in_environment(&environment.name);
            let hosts: Vec<HostName> = search_records(search, &query).await?;
            service_hosts
                .entry(environment.name.clone())
                .or_default()
                .extend(hosts.into_iter().map(|host| host.0));
            environments.push(environment.name);
        }
    }

    let aggregation = Aggregation {
        service_hosts: restrict_to_known(service_hosts, &nodes),
        hostgroup_hosts: restrict_to_known(hostgroup_hosts, &nodes),
        roles: roles.into_iter().map(|role| role.name).collect(),
        public_domain: config.effective_public_domain().map(str::to_string),
        nodes,
        sysadmins,
        members,
        os_list,
        os_hosts,
        environments,
        services,
        eventhandlers,
        hostgroups,
    };

    info!(
        nodes = aggregation.nodes.len(),
        sysadmins = aggregation.sysadmins.len(),
        roles = aggregation.roles.len(),
        environments = aggregation.environments.len(),
        services = aggregation.services.len(),
        eventhandlers = aggregation.eventhandlers.len(),
        hostgroups = aggregation.hostgroups.len(),
        "inventory aggregated"
    );

    Ok(aggregation)
}

/// Node query for this run: every environment, or only the local one.
pub fn node_query(config: &Config) -> SearchQuery {
    if config.multi_environment {
        SearchQuery::all_nodes()
    } else {
        SearchQuery::nodes_in_environment(&config.local_node.environment)
    }
}

fn scoped(query: SearchQuery, config: &Config) -> SearchQuery {
    if config.multi_environment {
        query
    } else {
        query.and_environment(&config.local_node.environment)
    }
}

pub fn effective_nodes(found: Vec<Node>, local: &Node) -> Vec<Node> {
    if found.is_empty() {
        info!(
            hostname = %local.hostname,
            "no nodes returned from search, using the local node so hosts have data"
        );
        return vec![local.clone()];
    }
    found
}

/// Distinct operating systems in order of first occurrence.
pub fn distinct_os(nodes: &[Node], enabled: bool) -> Vec<String> {
    if !enabled {
        return Vec::new();
    }

    let mut seen = HashSet::new();
    nodes
        .iter()
        .filter(|node| seen.insert(node.os.as_str()))
        .map(|node| node.os.clone())
        .collect()
}

pub fn os_hosts(nodes: &[Node], enabled: bool) -> HostMap {
    let mut map = HostMap::new();
    if enabled {
        for node in nodes {
            map.entry(node.os.clone())
                .or_default()
                .insert(node.hostname.clone());
        }
    }
    map
}

/// Drops members that are not defined as hosts in this run.
pub fn restrict_to_known(map: HostMap, nodes: &[Node]) -> HostMap {
    let known: HashSet<&str> = nodes.iter().map(|node| node.hostname.as_str()).collect();
    map.into_iter()
        .map(|(name, hosts)| {
            let before = hosts.len();
            let kept: BTreeSet<String> = hosts
                .into_iter()
                .filter(|host| known.contains(host.as_str()))
                .collect();
            if kept.len() < before {
                warn!(
                    hostgroup = %name,
                    dropped = before - kept.len(),
                    "hostgroup members outside the monitored node set were dropped"
                );
            }
            (name, kept)
        })
        .collect()
}

async fn load_hostgroups(
    search: &dyn InventorySearch,
    config: &Config,
) -> Result<SearchOutcome<(String, BTreeSet<String>)>, ProvisionError> {
    let definitions = match search_optional::<HostgroupDefinition>(
        search,
        &SearchQuery::data_bag(HOSTGROUPS_DATA_BAG),
    )
    .await?
    {
        SearchOutcome::Found(definitions) => definitions,
        SearchOutcome::Unavailable { reason } => return Ok(SearchOutcome::Unavailable { reason }),
    };

    let mut hostgroups = Vec::with_capacity(definitions.len());
    for definition in definitions {
        let query = scoped(SearchQuery::nodes_matching(&definition.search_query), config);
        match search_optional::<HostName>(search, &query).await? {
            SearchOutcome::Found(hosts) => hostgroups.push((
                definition.hostgroup_name,
                hosts.into_iter().map(|host| host.0).collect(),
            )),
            SearchOutcome::Unavailable { reason } => {
                return Ok(SearchOutcome::Unavailable {
                    reason: format!("hostgroup {}: {reason}", definition.hostgroup_name),
                })
            }
        }
    }

    Ok(SearchOutcome::Found(hostgroups))
}

/// Search whose failure aborts the run.
pub async fn search_records<T: FromRecord>(
    search: &dyn InventorySearch,
    query: &SearchQuery,
) -> Result<Vec<T>, ProvisionError> {
    let records = search.search(query).await?;
    parse_records(records)
}

/// Search whose unavailability is reported instead of raised.
pub async fn search_optional<T: FromRecord>(
    search: &dyn InventorySearch,
    query: &SearchQuery,
) -> Result<SearchOutcome<T>, ProvisionError> {
    match search.search(query).await {
        Ok(records) => Ok(SearchOutcome::Found(parse_records(records)?)),
        Err(SearchError::Unavailable { reason, .. }) => Ok(SearchOutcome::Unavailable { reason }),
        Err(err) => Err(err.into()),
    }
}

fn parse_records<T: FromRecord>(records: Vec<Record>) -> Result<Vec<T>, ProvisionError> {
    records.iter().map(T::from_record).collect()
}
