//! Attribute schemas.
//!
//! A schema describes one entity kind: how the id is found, which incoming
//! values are normalized, which attributes are derived from others, which
//! attributes point at entities of another kind, and which status value
//! removes the entity from its collection.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

use serde_json::Value;

use crate::entity::{Commit, EntityEvent};
use crate::error::{Error, Result};

/// Attribute storage of an entity.
pub type Attributes = BTreeMap<String, Value>;

/// Normalizes an incoming attribute value.
pub type Transform = fn(Value) -> Value;

/// Computes a derived attribute from the current attributes.
pub type DeriveFn = Rc<dyn Fn(&Attributes) -> Value>;

/// Inspects a finished commit and optionally produces an extra event.
pub type CommitHook = fn(&Commit) -> Option<EntityEvent>;

/// Entity kinds known to the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    Image,
    Flavor,
    VirtualMachine,
    Network,
    Volume,
    PublicKey,
    Quota,
    FloatingIpPool,
}

impl Kind {
    pub const ALL: [Kind; 8] = [
        Kind::Image,
        Kind::Flavor,
        Kind::VirtualMachine,
        Kind::Network,
        Kind::Volume,
        Kind::PublicKey,
        Kind::Quota,
        Kind::FloatingIpPool,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Image => "image",
            Kind::Flavor => "flavor",
            Kind::VirtualMachine => "vm",
            Kind::Network => "network",
            Kind::Volume => "volume",
            Kind::PublicKey => "key",
            Kind::Quota => "quota",
            Kind::FloatingIpPool => "floating-ip-pool",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Kind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "image" | "images" => Ok(Kind::Image),
            "flavor" | "flavors" => Ok(Kind::Flavor),
            "vm" | "vms" | "server" | "servers" => Ok(Kind::VirtualMachine),
            "network" | "networks" => Ok(Kind::Network),
            "volume" | "volumes" => Ok(Kind::Volume),
            "key" | "keys" => Ok(Kind::PublicKey),
            "quota" | "quotas" => Ok(Kind::Quota),
            "floating-ip-pool" | "floating-ip-pools" | "pools" => Ok(Kind::FloatingIpPool),
            other => Err(Error::Parse(format!("unknown resource: {}", other))),
        }
    }
}

/// A derived attribute node.
pub struct Derived {
    pub name: String,
    pub deps: Vec<String>,
    compute: DeriveFn,
}

impl Derived {
    pub fn compute(&self, attrs: &Attributes) -> Value {
        (self.compute)(attrs)
    }

    pub fn depends_on(&self, key: &str) -> bool {
        self.deps.iter().any(|d| d == key)
    }
}

/// An attribute holding the id of an entity of another kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
    pub attr: &'static str,
    pub target: Kind,
}

/// Validated schema of one kind. Derived nodes are stored in evaluation order.
pub struct Schema {
    kind: Kind,
    id_attr: &'static str,
    transforms: HashMap<&'static str, Transform>,
    derived: Vec<Derived>,
    references: Vec<Reference>,
    terminal_status: Option<&'static str>,
    hooks: Vec<CommitHook>,
}

impl Schema {
    pub fn builder(kind: Kind) -> SchemaBuilder {
        SchemaBuilder::new(kind)
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn id_attr(&self) -> &'static str {
        self.id_attr
    }

    pub fn derived(&self) -> &[Derived] {
        &self.derived
    }

    pub fn references(&self) -> &[Reference] {
        &self.references
    }

    pub fn terminal_status(&self) -> Option<&'static str> {
        self.terminal_status
    }

    pub fn hooks(&self) -> &[CommitHook] {
        &self.hooks
    }

    /// Apply the transform registered for `key`, if any.
    pub fn transform(&self, key: &str, value: Value) -> Value {
        match self.transforms.get(key) {
            Some(f) => f(value),
            None => value,
        }
    }

    /// Read and normalize the id of a raw record.
    pub fn extract_id(&self, record: &Value) -> Result<String> {
        match record.get(self.id_attr) {
            Some(value) => id_string(value).ok_or_else(|| {
                Error::Parse(format!(
                    "{} record has invalid '{}': {}",
                    self.kind, self.id_attr, value
                ))
            }),
            None => Err(Error::Parse(format!(
                "{} record without '{}'",
                self.kind, self.id_attr
            ))),
        }
    }

    /// Whether a raw record already carries the terminal status.
    pub fn is_terminal(&self, record: &Value) -> bool {
        match (self.terminal_status, record.get("status").and_then(Value::as_str)) {
            (Some(terminal), Some(status)) => status.eq_ignore_ascii_case(terminal),
            _ => false,
        }
    }
}

/// Normalize a JSON id (string or integer) to a string.
pub fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Builder for [`Schema`]; `build` validates the declarations.
pub struct SchemaBuilder {
    kind: Kind,
    id_attr: &'static str,
    transforms: Vec<(&'static str, Transform)>,
    derived: Vec<Derived>,
    references: Vec<Reference>,
    terminal_status: Option<&'static str>,
    hooks: Vec<CommitHook>,
}

impl SchemaBuilder {
    pub fn new(kind: Kind) -> Self {
        Self {
            kind,
            id_attr: "id",
            transforms: Vec::new(),
            derived: Vec::new(),
            references: Vec::new(),
            terminal_status: None,
            hooks: Vec::new(),
        }
    }

    pub fn id_attr(mut self, attr: &'static str) -> Self {
        self.id_attr = attr;
        self
    }

    pub fn transform(mut self, key: &'static str, f: Transform) -> Self {
        self.transforms.push((key, f));
        self
    }

    pub fn derive<F>(mut self, name: &str, deps: &[&str], f: F) -> Self
    where
        F: Fn(&Attributes) -> Value + 'static,
    {
        self.derived.push(Derived {
            name: name.to_string(),
            deps: deps.iter().map(|d| d.to_string()).collect(),
            compute: Rc::new(f),
        });
        self
    }

    pub fn reference(mut self, attr: &'static str, target: Kind) -> Self {
        self.references.push(Reference { attr, target });
        self
    }

    pub fn terminal_status(mut self, status: &'static str) -> Self {
        self.terminal_status = Some(status);
        self
    }

    pub fn hook(mut self, hook: CommitHook) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn build(self) -> Result<Rc<Schema>> {
        let kind = self.kind;

        let mut transforms = HashMap::new();
        for (key, f) in self.transforms {
            if key == self.id_attr {
                return Err(Error::Schema(format!(
                    "{}: the id attribute '{}' cannot be transformed",
                    kind, key
                )));
            }
            if transforms.insert(key, f).is_some() {
                return Err(Error::Schema(format!(
                    "{}: duplicate transform for '{}'",
                    kind, key
                )));
            }
        }

        let mut seen = HashSet::new();
        for node in &self.derived {
            if node.name == self.id_attr {
                return Err(Error::Schema(format!(
                    "{}: the id attribute cannot be derived",
                    kind
                )));
            }
            if !seen.insert(node.name.clone()) {
                return Err(Error::Schema(format!(
                    "{}: '{}' derived twice",
                    kind, node.name
                )));
            }
        }

        let derived = topological_order(kind, self.derived)?;

        Ok(Rc::new(Schema {
            kind,
            id_attr: self.id_attr,
            transforms,
            derived,
            references: self.references,
            terminal_status: self.terminal_status,
            hooks: self.hooks,
        }))
    }
}

/// Kahn's algorithm over derived-on-derived edges. Ties keep declaration order.
fn topological_order(kind: Kind, nodes: Vec<Derived>) -> Result<Vec<Derived>> {
    let names: HashMap<String, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.name.clone(), i))
        .collect();

    let mut indegree = vec![0usize; nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        for dep in &node.deps {
            if let Some(&j) = names.get(dep) {
                indegree[i] += 1;
                dependents[j].push(i);
            }
        }
    }

    let mut order = Vec::with_capacity(nodes.len());
    let mut ready: Vec<usize> = (0..nodes.len()).filter(|&i| indegree[i] == 0).collect();
    while !ready.is_empty() {
        ready.sort_unstable_by(|a, b| b.cmp(a));
        let Some(i) = ready.pop() else { break };
        order.push(i);
        for &k in &dependents[i] {
            indegree[k] -= 1;
            if indegree[k] == 0 {
                ready.push(k);
            }
        }
    }

    if order.len() != nodes.len() {
        let stuck: Vec<&str> = (0..nodes.len())
            .filter(|i| !order.contains(i))
            .map(|i| nodes[i].name.as_str())
            .collect();
        return Err(Error::Schema(format!(
            "{}: dependency cycle between {}",
            kind,
            stuck.join(", ")
        )));
    }

    let mut slots: Vec<Option<Derived>> = nodes.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn constant(v: Value) -> impl Fn(&Attributes) -> Value {
        move |_| v.clone()
    }

    #[test]
    fn test_derived_sorted_by_dependency() {
        let schema = Schema::builder(Kind::VirtualMachine)
            .derive("c", &["b"], constant(json!(3)))
            .derive("b", &["a"], constant(json!(2)))
            .derive("a", &["status"], constant(json!(1)))
            .build()
            .unwrap();
        let order: Vec<&str> = schema.derived().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_independent_nodes_keep_declaration_order() {
        let schema = Schema::builder(Kind::Image)
            .derive("x", &["name"], constant(json!(1)))
            .derive("y", &["name"], constant(json!(2)))
            .build()
            .unwrap();
        let order: Vec<&str> = schema.derived().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(order, vec!["x", "y"]);
    }

    #[test]
    fn test_cycle_rejected() {
        let result = Schema::builder(Kind::Flavor)
            .derive("a", &["b"], constant(json!(1)))
            .derive("b", &["a"], constant(json!(2)))
            .build();
        match result {
            Err(Error::Schema(msg)) => assert!(msg.contains("cycle")),
            Err(other) => panic!("Unexpected error: {:?}", other),
            Ok(_) => panic!("Expected cycle error"),
        }
    }

    #[test]
    fn test_duplicate_transform_rejected() {
        fn same(v: Value) -> Value {
            v
        }
        let result = Schema::builder(Kind::Network)
            .transform("status", same)
            .transform("status", same)
            .build();
        assert!(matches!(result, Err(Error::Schema(_))));
    }

    #[test]
    fn test_extract_id_normalizes_numbers() {
        let schema = Schema::builder(Kind::VirtualMachine).build().unwrap();
        assert_eq!(schema.extract_id(&json!({"id": 42})).unwrap(), "42");
        assert_eq!(schema.extract_id(&json!({"id": "abc"})).unwrap(), "abc");
        assert!(schema.extract_id(&json!({"name": "x"})).is_err());
        assert!(schema.extract_id(&json!({"id": ""})).is_err());
    }

    #[test]
    fn test_terminal_record() {
        let schema = Schema::builder(Kind::VirtualMachine)
            .terminal_status("DELETED")
            .build()
            .unwrap();
        assert!(schema.is_terminal(&json!({"id": 1, "status": "deleted"})));
        assert!(!schema.is_terminal(&json!({"id": 1, "status": "ACTIVE"})));
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("servers".parse::<Kind>().unwrap(), Kind::VirtualMachine);
        assert_eq!("keys".parse::<Kind>().unwrap(), Kind::PublicKey);
        assert!("widgets".parse::<Kind>().is_err());
    }
}
