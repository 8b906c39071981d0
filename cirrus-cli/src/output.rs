//! Table rendering for entities.

use cirrus_model::{EntityRef, Kind, MachineView};
use serde_json::Value;
use tabled::{Table, Tabled};

#[derive(Tabled)]
struct VmRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "FLAVOR")]
    flavor: String,
    #[tabled(rename = "IMAGE")]
    image: String,
    #[tabled(rename = "ACTIONS")]
    actions: String,
}

impl From<&EntityRef> for VmRow {
    fn from(vm: &EntityRef) -> Self {
        let state = text(vm, "state");
        let state = match vm.get("pending_action") {
            Some(Value::String(pending)) => format!("{} (pending {})", state, pending),
            _ => state,
        };
        Self {
            id: vm.id().to_string(),
            name: text(vm, "name"),
            state,
            flavor: related_name(vm, "flavor"),
            image: related_name(vm, "image"),
            actions: list(vm, "actions"),
        }
    }
}

#[derive(Tabled)]
struct VmCompactRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "STATE")]
    state: String,
}

#[derive(Tabled)]
struct ImageRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "SIZE")]
    size: String,
}

#[derive(Tabled)]
struct FlavorRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "VCPUS")]
    vcpus: String,
    #[tabled(rename = "RAM")]
    ram: String,
    #[tabled(rename = "DISK")]
    disk: String,
}

#[derive(Tabled)]
struct NetworkRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "CIDR")]
    cidr: String,
}

#[derive(Tabled)]
struct VolumeRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "SIZE")]
    size: String,
    #[tabled(rename = "SERVER")]
    server: String,
}

#[derive(Tabled)]
struct KeyRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "FINGERPRINT")]
    fingerprint: String,
}

#[derive(Tabled)]
struct QuotaRow {
    #[tabled(rename = "RESOURCE")]
    resource: String,
    #[tabled(rename = "LIMIT")]
    limit: String,
    #[tabled(rename = "USAGE")]
    usage: String,
    #[tabled(rename = "AVAILABLE")]
    available: String,
}

#[derive(Tabled)]
struct PoolRow {
    #[tabled(rename = "NAME")]
    name: String,
}

/// Render the members of one collection.
pub fn table(kind: Kind, entities: &[EntityRef], view: MachineView) -> Table {
    match kind {
        Kind::VirtualMachine => match view {
            MachineView::Table => Table::new(entities.iter().map(VmRow::from)),
            MachineView::Compact => Table::new(entities.iter().map(|vm| VmCompactRow {
                name: text(vm, "name"),
                state: text(vm, "state"),
            })),
        },
        Kind::Image => Table::new(entities.iter().map(|e| ImageRow {
            id: e.id().to_string(),
            name: text(e, "name"),
            status: text(e, "status"),
            size: e.get_f64("size").map(format_bytes).unwrap_or_else(dash),
        })),
        Kind::Flavor => Table::new(entities.iter().map(|e| FlavorRow {
            id: e.id().to_string(),
            name: text(e, "name"),
            vcpus: text(e, "vcpus"),
            ram: format!("{}MB", text(e, "ram")),
            disk: format!("{}GB", text(e, "disk")),
        })),
        Kind::Network => Table::new(entities.iter().map(|e| NetworkRow {
            id: e.id().to_string(),
            name: text(e, "name"),
            status: text(e, "status"),
            cidr: text(e, "cidr"),
        })),
        Kind::Volume => Table::new(entities.iter().map(|e| VolumeRow {
            id: e.id().to_string(),
            name: text(e, "name"),
            status: text(e, "status"),
            size: format!("{}GB", text(e, "size")),
            server: related_name(e, "server_id"),
        })),
        Kind::PublicKey => Table::new(entities.iter().map(|e| KeyRow {
            name: e.id().to_string(),
            fingerprint: text(e, "fingerprint"),
        })),
        Kind::Quota => Table::new(entities.iter().map(|e| QuotaRow {
            resource: e.id().to_string(),
            limit: text(e, "limit"),
            usage: text(e, "usage"),
            available: text(e, "available"),
        })),
        Kind::FloatingIpPool => Table::new(entities.iter().map(|e| PoolRow {
            name: e.id().to_string(),
        })),
    }
}

/// Attribute as display text; `-` when absent.
pub fn text(entity: &EntityRef, key: &str) -> String {
    match entity.get(key) {
        None | Some(Value::Null) => dash(),
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        Some(other) => other.to_string(),
    }
}

/// Comma-separated string array attribute.
pub fn list(entity: &EntityRef, key: &str) -> String {
    match entity.get(key) {
        Some(Value::Array(items)) if !items.is_empty() => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(","),
        _ => dash(),
    }
}

/// Name of the entity an attribute refers to, or the raw id while it is
/// unresolved.
pub fn related_name(entity: &EntityRef, attr: &str) -> String {
    match entity.related(attr) {
        Some(target) => text(&target, "name"),
        None => text(entity, attr),
    }
}

pub fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}B", value as u64)
    } else {
        format!("{:.1}{}", value, UNITS[unit])
    }
}

fn dash() -> String {
    "-".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512.0), "512B");
        assert_eq!(format_bytes(2048.0), "2.0KB");
        assert_eq!(format_bytes(2.0 * 1024.0 * 1024.0 * 1024.0), "2.0GB");
    }
}
