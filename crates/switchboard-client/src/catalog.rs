//! Callable-action catalog built from a node's API listing.

use std::collections::BTreeMap;

use switchboard_protocol::ApiAction;

/// Actions a dispatcher advertised, grouped into call namespaces.
///
/// `Report.Sales.run` version 1 lands in namespace `ReportSales` as method `run`;
/// version 2 of the same action lands in `ReportSalesV2`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApiCatalog {
    actions: Vec<ApiAction>,
    namespaces: BTreeMap<String, BTreeMap<String, ApiAction>>,
}

impl ApiCatalog {
    pub fn new(actions: Vec<ApiAction>) -> Self {
        let mut namespaces: BTreeMap<String, BTreeMap<String, ApiAction>> = BTreeMap::new();
        for action in &actions {
            let (ns, method) = split_action(action);
            namespaces
                .entry(ns)
                .or_default()
                .insert(method, action.clone());
        }
        Self {
            actions,
            namespaces,
        }
    }

    pub fn actions(&self) -> &[ApiAction] {
        &self.actions
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn supports(&self, action: &str, version: u32) -> bool {
        self.actions
            .iter()
            .any(|a| a.name() == action && a.version() == version)
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.namespaces.keys().map(String::as_str)
    }

    /// Methods of one namespace, by name.
    pub fn methods(&self, namespace: &str) -> Option<&BTreeMap<String, ApiAction>> {
        self.namespaces.get(namespace)
    }

    pub fn resolve(&self, namespace: &str, method: &str) -> Option<&ApiAction> {
        self.namespaces.get(namespace)?.get(method)
    }
}

fn split_action(action: &ApiAction) -> (String, String) {
    let (prefix, method) = match action.name().rsplit_once('.') {
        Some((prefix, method)) => (prefix.replace('.', ""), method.to_string()),
        None => (String::new(), action.name().to_string()),
    };
    if action.version() == 1 {
        (prefix, method)
    } else {
        (format!("{prefix}V{}", action.version()), method)
    }
}
