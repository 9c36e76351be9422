//! YAML inventory loader.
//!
//! The accepted format has top-level keys naming groups; each group carries
//! `hosts: {name: {vars}}` and optional `vars: {}`. Ansible's nested
//! `all.children.<group>.hosts` layout is NOT silently processed: a document
//! that yields no hosts is rejected with an error naming the mistake.

use indexmap::IndexMap;
use serde_json::Value;
use std::path::Path;

use super::{Group, Host, Inventory};
use crate::error::{Error, Result};
use crate::inventory::host::ConnectionKind;

/// Load an inventory from a YAML file.
pub fn load_file(path: &Path) -> Result<Inventory> {
    let text = std::fs::read_to_string(path).map_err(|e| Error::InventoryParse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    load_str(&text, path)
}

/// Load an inventory from YAML text; `path` is only used in error messages.
pub fn load_str(text: &str, path: &Path) -> Result<Inventory> {
    let doc: serde_yaml::Value =
        serde_yaml::from_str(text).map_err(|e| Error::InventoryParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    let serde_yaml::Value::Mapping(groups) = doc else {
        return Err(Error::InventoryParse {
            path: path.to_path_buf(),
            message: "inventory root must be a mapping of group names".to_string(),
        });
    };

    let mut inventory = Inventory::new();
    let mut saw_children = false;

    for (group_key, group_value) in groups {
        let Some(group_name) = group_key.as_str() else {
            return Err(Error::InventoryParse {
                path: path.to_path_buf(),
                message: format!("group name is not a string: {group_key:?}"),
            });
        };

        let mut group = Group::new(group_name);

        if let serde_yaml::Value::Mapping(body) = &group_value {
            if body.contains_key("children") {
                saw_children = true;
            }

            if let Some(serde_yaml::Value::Mapping(hosts)) = body.get("hosts") {
                for (host_key, host_value) in hosts {
                    let Some(host_name) = host_key.as_str() else {
                        return Err(Error::InventoryParse {
                            path: path.to_path_buf(),
                            message: format!("host name is not a string: {host_key:?}"),
                        });
                    };
                    let host = parse_host(host_name, host_value, path)?;
                    group.add_host(host_name);
                    inventory.add_host(host, &[group_name.to_string()]);
                }
            }

            if let Some(serde_yaml::Value::Mapping(vars)) = body.get("vars") {
                for (k, v) in vars {
                    if let Some(key) = k.as_str() {
                        group.vars.insert(key.to_string(), yaml_to_json(v.clone()));
                    }
                }
            }
        }

        // Registers membership and carries the group vars; replaces the
        // bare group add_host created above with an identical member list.
        inventory.add_group(group);
    }

    if inventory.is_empty() {
        let hint = if saw_children {
            "nested 'all.children.<group>.hosts' layouts are not supported; \
             use top-level group names with a 'hosts' mapping"
        } else {
            "no hosts were loaded; each group needs a 'hosts' mapping"
        };
        return Err(Error::InventoryParse {
            path: path.to_path_buf(),
            message: hint.to_string(),
        });
    }

    Ok(inventory)
}

/// Build a [`Host`], hoisting well-known connection variables.
fn parse_host(name: &str, value: &serde_yaml::Value, path: &Path) -> Result<Host> {
    let mut host = Host::new(name);

    let serde_yaml::Value::Mapping(vars) = value else {
        // `hostname:` with no body is a bare host.
        if value.is_null() {
            return Ok(host);
        }
        return Err(Error::InventoryParse {
            path: path.to_path_buf(),
            message: format!("host '{name}' body must be a mapping of variables"),
        });
    };

    let mut extra: IndexMap<String, Value> = IndexMap::new();
    for (key, val) in vars {
        let Some(key) = key.as_str() else { continue };
        match key {
            "ansible_host" => host.address = val.as_str().map(str::to_string),
            "ansible_port" => {
                host.port = val
                    .as_u64()
                    .and_then(|p| u16::try_from(p).ok())
                    .ok_or_else(|| Error::InventoryParse {
                        path: path.to_path_buf(),
                        message: format!("host '{name}' has an invalid ansible_port"),
                    })?;
            }
            "ansible_user" => host.user = val.as_str().map(str::to_string),
            "ansible_connection" => {
                host.connection = match val.as_str() {
                    Some("local") => ConnectionKind::Local,
                    Some("ssh") | None => ConnectionKind::Ssh,
                    Some(other) => {
                        return Err(Error::InventoryParse {
                            path: path.to_path_buf(),
                            message: format!(
                                "host '{name}' has unsupported ansible_connection '{other}'"
                            ),
                        })
                    }
                };
            }
            "ansible_python_interpreter" => {
                host.interpreter = val.as_str().map(str::to_string)
            }
            "ansible_ssh_private_key_file" => {
                host.private_key_file = val.as_str().map(str::to_string)
            }
            "ansible_ssh_pass" => host.password = val.as_str().map(str::to_string),
            _ => {
                extra.insert(key.to_string(), yaml_to_json(val.clone()));
            }
        }
    }
    host.vars = extra;
    Ok(host)
}

/// Convert a YAML value into its JSON equivalent.
fn yaml_to_json(value: serde_yaml::Value) -> Value {
    serde_json::to_value(&value).unwrap_or(Value::Null)
}
