//! MCP tool catalogue.
//!
//! Each tool is a [`ToolDescriptor`]: a name, a parameter list that doubles
//! as the JSON schema returned by `tools/list` and as the validator for
//! `tools/call`, and an action. REST actions are data: a method, a path
//! template (`/v2/device/{id}`), and where leftover arguments go. The
//! dispatcher never needs to know what an endpoint means.
//!
//! ## Tool categories
//!
//! **Organizations**: `list_organizations`, `get_organization`
//!
//! **Devices**: `list_devices`, `list_devices_detailed`, `get_device`,
//! `get_device_activities`, `reboot_device`, `set_device_maintenance`,
//! `cancel_device_maintenance`
//!
//! **Alerts**: `list_alerts`, `reset_alert`
//!
//! **Gateway** (no upstream call): `get_region`, `set_region`

use std::collections::HashMap;

use reqwest::Method;
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;
use tracing::info;

use crate::error::GatewayError;
use crate::upstream::UpstreamClient;

/// JSON type of a tool parameter.
#[derive(Debug, Clone, Copy)]
pub enum ParamKind {
    String,
    Integer,
    Boolean,
    StringArray,
    /// A string restricted to the listed values.
    Enum(&'static [&'static str]),
}

/// One tool parameter.
#[derive(Debug, Clone, Copy)]
pub struct Param {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
    pub description: &'static str,
}

const fn required(name: &'static str, kind: ParamKind, description: &'static str) -> Param {
    Param {
        name,
        kind,
        required: true,
        description,
    }
}

const fn optional(name: &'static str, kind: ParamKind, description: &'static str) -> Param {
    Param {
        name,
        kind,
        required: false,
        description,
    }
}

/// Where arguments that are not path parameters are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgsIn {
    Query,
    Body,
}

#[derive(Debug, Clone)]
pub enum ToolAction {
    /// Pass-through call to the upstream API.
    Rest {
        method: Method,
        path: &'static str,
        args_in: ArgsIn,
    },
    /// Report the resolved upstream endpoint.
    ShowRegion,
    /// Pin the upstream endpoint to a region key or URL.
    PinRegion,
}

#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub params: &'static [Param],
    pub action: ToolAction,
}

/// What a tool needs from the session that invokes it.
pub struct ToolContext<'a> {
    pub upstream: &'a UpstreamClient,
    /// Server-push channel of the calling session, if it has one.
    pub notifier: Option<&'a broadcast::Sender<Value>>,
}

/// Result of an MCP tool call, ready to be serialized into a JSON-RPC response.
#[derive(Debug)]
pub struct ToolResult {
    /// MCP content blocks (a single `{"type":"text","text":"..."}` entry).
    pub content: Vec<Value>,
    /// Maps to `isError` in the MCP response.
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(value: &Value) -> Self {
        let text = serde_json::to_string_pretty(value).unwrap_or_default();
        Self {
            content: vec![json!({ "type": "text", "text": text })],
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![json!({ "type": "text", "text": message.into() })],
            is_error: true,
        }
    }

    pub fn to_json(&self) -> Value {
        let mut result = json!({ "content": self.content });
        if self.is_error {
            result["isError"] = json!(true);
        }
        result
    }
}

impl ToolDescriptor {
    /// The `tools/list` entry for this tool.
    pub fn definition(&self) -> Value {
        let mut properties = Map::new();
        for param in self.params {
            let mut schema = match param.kind {
                ParamKind::String => json!({ "type": "string" }),
                ParamKind::Integer => json!({ "type": "integer" }),
                ParamKind::Boolean => json!({ "type": "boolean" }),
                ParamKind::StringArray => {
                    json!({ "type": "array", "items": { "type": "string" } })
                }
                ParamKind::Enum(values) => json!({ "type": "string", "enum": values }),
            };
            schema["description"] = json!(param.description);
            properties.insert(param.name.to_string(), schema);
        }
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name)
            .collect();
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": {
                "type": "object",
                "properties": properties,
                "required": required,
                "additionalProperties": false,
            }
        })
    }

    /// Check `args` against the parameter list. Returns the argument object.
    pub fn validate(&self, args: &Value) -> Result<Map<String, Value>, String> {
        let args = match args {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            _ => return Err("arguments must be an object".to_string()),
        };

        for key in args.keys() {
            if !self.params.iter().any(|p| p.name == key) {
                return Err(format!("unknown argument '{key}'"));
            }
        }
        for param in self.params {
            match args.get(param.name) {
                None | Some(Value::Null) if param.required => {
                    return Err(format!("missing required argument '{}'", param.name));
                }
                None | Some(Value::Null) => {}
                Some(value) => check_kind(param, value)?,
            }
        }
        Ok(args)
    }

    /// Validate and run the tool.
    pub async fn invoke(
        &self,
        args: &Value,
        ctx: &ToolContext<'_>,
    ) -> Result<Value, GatewayError> {
        let args = self.validate(args).map_err(GatewayError::Validation)?;
        match &self.action {
            ToolAction::Rest {
                method,
                path,
                args_in,
            } => {
                let (path, rest) = render_path(path, args).map_err(GatewayError::Validation)?;
                match args_in {
                    ArgsIn::Query => {
                        let query = to_query(&rest);
                        ctx.upstream.call(method.clone(), &path, &query, None).await
                    }
                    ArgsIn::Body => {
                        let body = (!rest.is_empty()).then(|| Value::Object(rest));
                        ctx.upstream
                            .call(method.clone(), &path, &[], body.as_ref())
                            .await
                    }
                }
            }
            ToolAction::ShowRegion => Ok(region_report(ctx.upstream)),
            ToolAction::PinRegion => {
                let target = args.get("region").and_then(Value::as_str).unwrap_or_default();
                let endpoint = ctx.upstream.credentials().set_endpoint(target)?;
                info!("Region pinned by tool call: {}", endpoint.base_url);
                if let Some(notifier) = ctx.notifier {
                    // No subscriber is fine: the GET stream is optional.
                    let _ = notifier.send(json!({
                        "jsonrpc": "2.0",
                        "method": "notifications/message",
                        "params": {
                            "level": "info",
                            "logger": "ninjaone-mcp",
                            "data": format!("Upstream endpoint pinned to {}", endpoint.base_url),
                        }
                    }));
                }
                Ok(region_report(ctx.upstream))
            }
        }
    }
}

fn check_kind(param: &Param, value: &Value) -> Result<(), String> {
    let ok = match param.kind {
        ParamKind::String => value.is_string(),
        ParamKind::Integer => value.is_i64() || value.is_u64(),
        ParamKind::Boolean => value.is_boolean(),
        ParamKind::StringArray => value
            .as_array()
            .is_some_and(|items| items.iter().all(Value::is_string)),
        ParamKind::Enum(values) => value.as_str().is_some_and(|s| values.contains(&s)),
    };
    if ok {
        Ok(())
    } else {
        Err(format!(
            "argument '{}' must be {}",
            param.name,
            describe_kind(param.kind)
        ))
    }
}

fn describe_kind(kind: ParamKind) -> String {
    match kind {
        ParamKind::String => "a string".to_string(),
        ParamKind::Integer => "an integer".to_string(),
        ParamKind::Boolean => "a boolean".to_string(),
        ParamKind::StringArray => "an array of strings".to_string(),
        ParamKind::Enum(values) => format!("one of {}", values.join(", ")),
    }
}

/// Substitute `{name}` segments from `args`, returning the path and the
/// arguments that were not consumed.
fn render_path(
    template: &str,
    mut args: Map<String, Value>,
) -> Result<(String, Map<String, Value>), String> {
    let mut path = String::with_capacity(template.len());
    for (i, segment) in template.split('/').enumerate() {
        if i > 0 {
            path.push('/');
        }
        match segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            Some(name) => {
                let value = args
                    .remove(name)
                    .ok_or_else(|| format!("missing path argument '{name}'"))?;
                let text = scalar_to_string(&value)
                    .ok_or_else(|| format!("path argument '{name}' must be a string or integer"))?;
                if text.is_empty()
                    || !text
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
                    || text == "."
                    || text == ".."
                {
                    return Err(format!("path argument '{name}' contains invalid characters"));
                }
                path.push_str(&text);
            }
            None => path.push_str(segment),
        }
    }
    Ok((path, args))
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn to_query(args: &Map<String, Value>) -> Vec<(String, String)> {
    args.iter()
        .filter_map(|(key, value)| {
            let text = match value {
                Value::Array(items) => items
                    .iter()
                    .filter_map(scalar_to_string)
                    .collect::<Vec<_>>()
                    .join(","),
                other => scalar_to_string(other)?,
            };
            Some((key.clone(), text))
        })
        .collect()
}

fn region_report(upstream: &UpstreamClient) -> Value {
    let credentials = upstream.credentials();
    let snapshot = credentials.snapshot();
    let regions: Vec<Value> = credentials
        .policy()
        .regions()
        .iter()
        .map(|r| json!({ "key": r.key, "base_url": r.base_url }))
        .collect();
    json!({
        "base_url": snapshot.endpoint.base_url,
        "explicit": snapshot.endpoint.explicit,
        "token_cached": snapshot.token_cached,
        "candidates": credentials.candidates(),
        "regions": regions,
    })
}

const PAGE_SIZE: Param = optional(
    "pageSize",
    ParamKind::Integer,
    "Maximum number of records to return.",
);
const AFTER: Param = optional(
    "after",
    ParamKind::Integer,
    "Return records after this id (cursor).",
);
const DEVICE_FILTER: Param = optional(
    "df",
    ParamKind::String,
    "Device filter expression, e.g. 'org = 12' or 'class in (WINDOWS_SERVER)'.",
);
const DEVICE_ID: Param = required("id", ParamKind::Integer, "Device id.");
const ORGANIZATION_ID: Param = required("id", ParamKind::Integer, "Organization id.");
const OLDER_THAN: Param = optional(
    "olderThan",
    ParamKind::Integer,
    "Return activities older than this activity id.",
);
const SOURCE_TYPE: Param = optional(
    "sourceType",
    ParamKind::String,
    "Only alerts of this source type.",
);
const ALERT_UID: Param = required("uid", ParamKind::String, "Alert uid.");
const REBOOT_MODE: Param = required("mode", ParamKind::Enum(&["NORMAL", "FORCED"]), "Reboot mode.");
const REBOOT_REASON: Param = optional(
    "reason",
    ParamKind::String,
    "Reason recorded in the activity log.",
);
const DISABLED_FEATURES: Param = required(
    "disabledFeatures",
    ParamKind::StringArray,
    "Features to suppress: ALERTS, PATCHING, AVSCANS, TASKS.",
);
const WINDOW_START: Param = optional(
    "start",
    ParamKind::Integer,
    "Window start, epoch seconds. Defaults to now.",
);
const WINDOW_END: Param = required("end", ParamKind::Integer, "Window end, epoch seconds.");
const REGION_TARGET: Param = required("region", ParamKind::String, "Region key or base URL.");

/// Built-in descriptors, in `tools/list` order.
fn builtin_descriptors() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            name: "list_organizations",
            description: "List organizations (customers) visible to the API client.",
            params: &[PAGE_SIZE, AFTER],
            action: ToolAction::Rest {
                method: Method::GET,
                path: "/v2/organizations",
                args_in: ArgsIn::Query,
            },
        },
        ToolDescriptor {
            name: "get_organization",
            description: "Get one organization with its locations and policy mappings.",
            params: &[ORGANIZATION_ID],
            action: ToolAction::Rest {
                method: Method::GET,
                path: "/v2/organization/{id}",
                args_in: ArgsIn::Query,
            },
        },
        ToolDescriptor {
            name: "list_devices",
            description: "List managed devices, optionally narrowed by a device filter.",
            params: &[DEVICE_FILTER, PAGE_SIZE, AFTER],
            action: ToolAction::Rest {
                method: Method::GET,
                path: "/v2/devices",
                args_in: ArgsIn::Query,
            },
        },
        ToolDescriptor {
            name: "list_devices_detailed",
            description: "List managed devices with OS, system and last-contact details.",
            params: &[DEVICE_FILTER, PAGE_SIZE, AFTER],
            action: ToolAction::Rest {
                method: Method::GET,
                path: "/v2/devices-detailed",
                args_in: ArgsIn::Query,
            },
        },
        ToolDescriptor {
            name: "get_device",
            description: "Get details for one device.",
            params: &[DEVICE_ID],
            action: ToolAction::Rest {
                method: Method::GET,
                path: "/v2/device/{id}",
                args_in: ArgsIn::Query,
            },
        },
        ToolDescriptor {
            name: "get_device_activities",
            description: "Get the activity log of one device.",
            params: &[DEVICE_ID, PAGE_SIZE, OLDER_THAN],
            action: ToolAction::Rest {
                method: Method::GET,
                path: "/v2/device/{id}/activities",
                args_in: ArgsIn::Query,
            },
        },
        ToolDescriptor {
            name: "list_alerts",
            description: "List active alerts (triggered conditions).",
            params: &[SOURCE_TYPE, DEVICE_FILTER],
            action: ToolAction::Rest {
                method: Method::GET,
                path: "/v2/alerts",
                args_in: ArgsIn::Query,
            },
        },
        ToolDescriptor {
            name: "reset_alert",
            description: "Reset (clear) an alert by its uid.",
            params: &[ALERT_UID],
            action: ToolAction::Rest {
                method: Method::POST,
                path: "/v2/alert/{uid}/reset",
                args_in: ArgsIn::Body,
            },
        },
        ToolDescriptor {
            name: "reboot_device",
            description: "Reboot a device. FORCED skips the graceful shutdown.",
            params: &[DEVICE_ID, REBOOT_MODE, REBOOT_REASON],
            action: ToolAction::Rest {
                method: Method::POST,
                path: "/v2/device/{id}/reboot/{mode}",
                args_in: ArgsIn::Body,
            },
        },
        ToolDescriptor {
            name: "set_device_maintenance",
            description: "Put a device into maintenance mode for a time window.",
            params: &[DEVICE_ID, DISABLED_FEATURES, WINDOW_START, WINDOW_END],
            action: ToolAction::Rest {
                method: Method::PUT,
                path: "/v2/device/{id}/maintenance",
                args_in: ArgsIn::Body,
            },
        },
        ToolDescriptor {
            name: "cancel_device_maintenance",
            description: "End maintenance mode for a device.",
            params: &[DEVICE_ID],
            action: ToolAction::Rest {
                method: Method::DELETE,
                path: "/v2/device/{id}/maintenance",
                args_in: ArgsIn::Body,
            },
        },
        ToolDescriptor {
            name: "get_region",
            description: "Show the upstream endpoint in use, whether it is pinned, and the known regions.",
            params: &[],
            action: ToolAction::ShowRegion,
        },
        ToolDescriptor {
            name: "set_region",
            description: "Pin the upstream endpoint to a region (us, eu, oc, ca, us2) or an allow-listed URL. Drops the cached token.",
            params: &[REGION_TARGET],
            action: ToolAction::PinRegion,
        },
    ]
}

/// Name → descriptor map with a stable listing order.
pub struct ToolRegistry {
    order: Vec<&'static str>,
    tools: HashMap<&'static str, ToolDescriptor>,
}

impl ToolRegistry {
    pub fn new(descriptors: Vec<ToolDescriptor>) -> Self {
        let order = descriptors.iter().map(|d| d.name).collect();
        let tools = descriptors.into_iter().map(|d| (d.name, d)).collect();
        Self { order, tools }
    }

    pub fn builtin() -> Self {
        Self::new(builtin_descriptors())
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// `tools/list` payload.
    pub fn definitions(&self) -> Vec<Value> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(ToolDescriptor::definition)
            .collect()
    }

    /// Run a tool by name. Failures become error results, never panics.
    pub async fn call(&self, name: &str, args: &Value, ctx: &ToolContext<'_>) -> ToolResult {
        let Some(tool) = self.get(name) else {
            return ToolResult::error(format!("Unknown tool: {name}"));
        };
        match tool.invoke(args, ctx).await {
            Ok(value) => ToolResult::success(&value),
            Err(err) => ToolResult::error(err.to_string()),
        }
    }
}
