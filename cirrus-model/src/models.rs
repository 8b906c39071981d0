//! Schemas and endpoints of the concrete entity kinds.

use std::cmp::Ordering;
use std::rc::Rc;

use serde_json::{Map, Value};

use crate::collection::Comparator;
use crate::entity::Entity;
use crate::error::Result;
use crate::schema::{Kind, Schema, id_string};
use crate::vm;

/// Collection path relative to the API base URL.
pub fn resource_path(kind: Kind) -> &'static str {
    match kind {
        Kind::Image => "/images/detail",
        Kind::Flavor => "/flavors/detail",
        Kind::VirtualMachine => "/servers/detail",
        Kind::Network => "/networks/detail",
        Kind::Volume => "/volumes/detail",
        Kind::PublicKey => "/keys",
        Kind::Quota => "/quotas",
        Kind::FloatingIpPool => "/os-floating-ip-pools",
    }
}

/// Key under which list responses carry the records.
pub fn envelope_key(kind: Kind) -> &'static str {
    match kind {
        Kind::Image => "images",
        Kind::Flavor => "flavors",
        Kind::VirtualMachine => "servers",
        Kind::Network => "networks",
        Kind::Volume => "volumes",
        Kind::PublicKey => "keypairs",
        Kind::Quota => "quotas",
        Kind::FloatingIpPool => "floating_ip_pools",
    }
}

pub fn schema_for(kind: Kind) -> Result<Rc<Schema>> {
    match kind {
        Kind::VirtualMachine => Schema::builder(kind)
            .transform("status", status)
            .transform("flavor", reference_id)
            .transform("image", reference_id)
            .transform("metadata", metadata)
            .derive("state", &["status"], vm::derive_state)
            .derive("actions", &["state"], vm::derive_actions)
            .derive("busy", &["status", "state"], vm::derive_busy)
            .reference("flavor", Kind::Flavor)
            .reference("image", Kind::Image)
            .terminal_status(vm::DELETED)
            .hook(vm::transition_hook)
            .build(),
        Kind::Network => Schema::builder(kind)
            .transform("status", status)
            .terminal_status(vm::DELETED)
            .build(),
        Kind::Volume => Schema::builder(kind)
            .transform("status", status)
            .transform("size", number)
            .reference("server_id", Kind::VirtualMachine)
            .terminal_status(vm::DELETED)
            .build(),
        Kind::Image => Schema::builder(kind)
            .transform("status", status)
            .transform("metadata", metadata)
            .transform("size", number)
            .build(),
        Kind::Flavor => Schema::builder(kind)
            .transform("ram", number)
            .transform("vcpus", number)
            .transform("disk", number)
            .build(),
        Kind::PublicKey => Schema::builder(kind).id_attr("name").build(),
        Kind::Quota => Schema::builder(kind)
            .id_attr("resource")
            .transform("limit", number)
            .transform("usage", number)
            .derive("available", &["limit", "usage"], |a| {
                let limit = a.get("limit").and_then(Value::as_f64).unwrap_or(0.0);
                let usage = a.get("usage").and_then(Value::as_f64).unwrap_or(0.0);
                number(Value::from((limit - usage).max(0.0)))
            })
            .build(),
        Kind::FloatingIpPool => Schema::builder(kind).id_attr("name").build(),
    }
}

/// Sort order used by the collection of `kind`.
pub fn comparator_for(kind: Kind) -> Option<Comparator> {
    match kind {
        Kind::VirtualMachine | Kind::Image | Kind::Network | Kind::Volume => {
            Some(Rc::new(by_name))
        }
        Kind::Flavor => Some(Rc::new(by_size)),
        _ => None,
    }
}

/// Per-record unwrapping applied after the envelope is removed.
pub fn unwrap_record(kind: Kind, record: Value) -> Value {
    match kind {
        // [{"keypair": {...}}, ...]
        Kind::PublicKey => match record {
            Value::Object(mut obj) if obj.len() == 1 && obj.contains_key("keypair") => {
                obj.remove("keypair").unwrap_or(Value::Null)
            }
            other => other,
        },
        _ => record,
    }
}

fn by_name(a: &Entity, b: &Entity) -> Ordering {
    let name = |e: &Entity| e.get_str("name").unwrap_or_default().to_lowercase();
    name(a)
        .cmp(&name(b))
        .then_with(|| natural_id(a.id()).cmp(&natural_id(b.id())))
}

fn by_size(a: &Entity, b: &Entity) -> Ordering {
    let key = |e: &Entity| {
        (
            e.get_f64("vcpus").unwrap_or(0.0),
            e.get_f64("ram").unwrap_or(0.0),
            e.get_f64("disk").unwrap_or(0.0),
        )
    };
    let (ka, kb) = (key(a), key(b));
    ka.partial_cmp(&kb)
        .unwrap_or(Ordering::Equal)
        .then_with(|| natural_id(a.id()).cmp(&natural_id(b.id())))
}

/// Numeric ids sort numerically, everything else after them lexically.
fn natural_id(id: &str) -> (u8, u64, String) {
    match id.parse::<u64>() {
        Ok(n) => (0, n, String::new()),
        Err(_) => (1, 0, id.to_string()),
    }
}

fn status(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.trim().to_uppercase()),
        Value::Null => Value::String(vm::UNKNOWN.to_string()),
        other => Value::String(other.to_string().to_uppercase()),
    }
}

/// `{"id": 3, "links": [...]}`, `3` and `"3"` all become `"3"`.
fn reference_id(value: Value) -> Value {
    let id = match &value {
        Value::Object(obj) => obj.get("id").and_then(id_string),
        other => id_string(other),
    };
    id.map(Value::String).unwrap_or(Value::Null)
}

/// Legacy responses wrap metadata as `{"values": {...}}`.
fn metadata(value: Value) -> Value {
    match value {
        Value::Object(mut obj) if obj.len() == 1 && obj.get("values").is_some_and(Value::is_object) => {
            obj.remove("values").unwrap_or_else(|| Value::Object(Map::new()))
        }
        Value::Object(obj) => Value::Object(obj),
        _ => Value::Object(Map::new()),
    }
}

/// Numeric strings become numbers; integral floats become integers.
fn number(value: Value) -> Value {
    let n = match &value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match n {
        Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Value::from(f as i64),
        Some(f) => Value::from(f),
        None => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_every_kind_has_a_valid_schema() {
        for kind in Kind::ALL {
            let schema = schema_for(kind).unwrap();
            assert_eq!(schema.kind(), kind);
        }
    }

    #[test]
    fn test_vm_schema_derives_state_and_actions() {
        let vm = Entity::new(
            schema_for(Kind::VirtualMachine).unwrap(),
            json!({"id": 1, "status": "active", "flavor": {"id": 3, "links": []}}),
        )
        .unwrap();
        assert_eq!(vm.get_str("status").unwrap(), "ACTIVE");
        assert_eq!(vm.get_str("state").unwrap(), "ACTIVE");
        assert_eq!(vm.get_str("flavor").unwrap(), "3");
        assert_eq!(vm.get("busy"), Some(json!(false)));
        assert_eq!(
            vm.get("actions"),
            Some(json!(["shutdown", "destroy", "reboot", "console"]))
        );
        assert_eq!(vm.get("metadata"), None);
    }

    #[test]
    fn test_vm_without_status_starts_in_error() {
        let vm = Entity::new(schema_for(Kind::VirtualMachine).unwrap(), json!({"id": 1})).unwrap();
        assert_eq!(vm.get_str("state").unwrap(), "ERROR");
    }

    #[test]
    fn test_metadata_unwraps_legacy_values() {
        assert_eq!(
            metadata(json!({"values": {"os": "debian"}})),
            json!({"os": "debian"})
        );
        assert_eq!(metadata(json!({"os": "debian"})), json!({"os": "debian"}));
        assert_eq!(metadata(Value::Null), json!({}));
    }

    #[test]
    fn test_number_coercion() {
        assert_eq!(number(json!("2048")), json!(2048));
        assert_eq!(number(json!(1.5)), json!(1.5));
        assert_eq!(number(json!("n/a")), json!("n/a"));
    }

    #[test]
    fn test_quota_available() {
        let quota = Entity::new(
            schema_for(Kind::Quota).unwrap(),
            json!({"resource": "vm", "limit": 5, "usage": "2"}),
        )
        .unwrap();
        assert_eq!(quota.id(), "vm");
        assert_eq!(quota.get("available"), Some(json!(3)));
    }

    #[test]
    fn test_keypair_unwrapped() {
        let record = unwrap_record(
            Kind::PublicKey,
            json!({"keypair": {"name": "laptop", "public_key": "ssh-ed25519 AAAA"}}),
        );
        assert_eq!(record["name"], "laptop");
    }

    #[test]
    fn test_natural_id_order() {
        assert!(natural_id("9") < natural_id("10"));
        assert!(natural_id("10") < natural_id("abc"));
    }
}
