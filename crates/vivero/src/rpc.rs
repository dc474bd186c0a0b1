//! JSON-RPC-style HTTP endpoint.
//!
//! POST `/` takes `{method, args, kwargs, auth?}` and always answers with
//! an envelope, never an empty body: `{status: "success", result}` on
//! success, `{status: "exception", result: {class, message}}` on failure,
//! `{status: "autherror", result: {message}}` when authentication data is
//! missing or wrong. GET `/` documents the available methods.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::config::UserConfig;
use crate::error::{ViveroError, ViveroResult};
use crate::models::PoolId;
use crate::service::{Caller, PoolRequest, PoolService};

/// Shared state of the RPC endpoint
#[derive(Debug)]
pub struct RpcState {
    /// The service the endpoint fronts
    pub service: Arc<PoolService>,
    /// Users allowed on authenticated methods
    pub users: Vec<UserConfig>,
}

/// The RPC application
#[must_use]
pub fn router(state: Arc<RpcState>) -> Router {
    Router::new()
        .route("/", get(rpc_doc).post(rpc_post))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    method: String,
    #[serde(default)]
    args: Vec<Value>,
    #[serde(default)]
    kwargs: Map<String, Value>,
    #[serde(default)]
    auth: Option<(String, String)>,
}

struct MethodSpec {
    name: &'static str,
    args: &'static [&'static str],
    defaults: &'static [(&'static str, &'static str)],
    doc: &'static str,
    needs_authentication: bool,
}

static METHODS: &[MethodSpec] = &[
    MethodSpec {
        name: "request_appliances",
        args: &[
            "group",
            "count",
            "lease_time",
            "template",
            "provider",
            "version",
            "date",
            "preconfigured",
            "yum_update",
        ],
        defaults: &[
            ("count", "1"),
            ("lease_time", "60"),
            ("template", "null"),
            ("provider", "null"),
            ("version", "null"),
            ("date", "null"),
            ("preconfigured", "true"),
            ("yum_update", "false"),
        ],
        doc: "Create an appliance pool and return its id immediately.",
        needs_authentication: true,
    },
    MethodSpec {
        name: "request_check",
        args: &["request_id"],
        defaults: &[],
        doc: "Fulfillment status and appliances of a pool.",
        needs_authentication: false,
    },
    MethodSpec {
        name: "prolong_appliance_lease",
        args: &["id", "minutes"],
        defaults: &[("minutes", "60")],
        doc: "Extend an appliance lease from now.",
        needs_authentication: true,
    },
    MethodSpec {
        name: "prolong_appliance_pool_lease",
        args: &["id", "minutes"],
        defaults: &[("minutes", "60")],
        doc: "Extend the lease of every appliance in a pool.",
        needs_authentication: true,
    },
    MethodSpec {
        name: "destroy_pool",
        args: &["id"],
        defaults: &[],
        doc: "Give a pool up; the reaper tears it down.",
        needs_authentication: true,
    },
    MethodSpec {
        name: "pool_exists",
        args: &["id"],
        defaults: &[],
        doc: "Whether the pool still exists.",
        needs_authentication: false,
    },
    MethodSpec {
        name: "set_pool_description",
        args: &["id", "description"],
        defaults: &[],
        doc: "Change a pool's description.",
        needs_authentication: true,
    },
    MethodSpec {
        name: "get_pool_description",
        args: &["id"],
        defaults: &[],
        doc: "A pool's description.",
        needs_authentication: false,
    },
    MethodSpec {
        name: "find_pools_by_description",
        args: &["description"],
        defaults: &[],
        doc: "Ids of pools whose description contains the fragment.",
        needs_authentication: false,
    },
    MethodSpec {
        name: "list_appliances",
        args: &["owner"],
        defaults: &[("owner", "null")],
        doc: "All appliances, optionally restricted to one owner.",
        needs_authentication: false,
    },
    MethodSpec {
        name: "num_shepherd_appliances",
        args: &["group"],
        defaults: &[("group", "null")],
        doc: "Ready unassigned appliances kept warm.",
        needs_authentication: false,
    },
    MethodSpec {
        name: "get_number_free_appliances",
        args: &["group"],
        defaults: &[],
        doc: "Target size of the group's warm pool.",
        needs_authentication: false,
    },
    MethodSpec {
        name: "set_number_free_appliances",
        args: &["group", "n"],
        defaults: &[],
        doc: "Set the target size of the group's warm pool. Staff only.",
        needs_authentication: true,
    },
    MethodSpec {
        name: "available_cfme_versions",
        args: &["preconfigured", "group"],
        defaults: &[("preconfigured", "true"), ("group", "null")],
        doc: "Product versions available, newest first.",
        needs_authentication: false,
    },
    MethodSpec {
        name: "available_groups",
        args: &[],
        defaults: &[],
        doc: "Known template groups.",
        needs_authentication: false,
    },
    MethodSpec {
        name: "available_providers",
        args: &[],
        defaults: &[],
        doc: "Known providers.",
        needs_authentication: false,
    },
    MethodSpec {
        name: "add_provider",
        args: &["provider_key"],
        defaults: &[],
        doc: "Register a provider. Staff only.",
        needs_authentication: true,
    },
    MethodSpec {
        name: "destroy_appliance",
        args: &["id"],
        defaults: &[],
        doc: "Request appliance teardown; idempotent.",
        needs_authentication: true,
    },
    MethodSpec {
        name: "power_on",
        args: &["id"],
        defaults: &[],
        doc: "Power an appliance on.",
        needs_authentication: true,
    },
    MethodSpec {
        name: "power_off",
        args: &["id"],
        defaults: &[],
        doc: "Power an appliance off.",
        needs_authentication: true,
    },
    MethodSpec {
        name: "suspend",
        args: &["id"],
        defaults: &[],
        doc: "Suspend an appliance.",
        needs_authentication: true,
    },
    MethodSpec {
        name: "power_state",
        args: &["id"],
        defaults: &[],
        doc: "Last observed power state, by id, IP, or name.",
        needs_authentication: false,
    },
];

async fn rpc_doc() -> Json<Value> {
    let methods: Vec<Value> = METHODS
        .iter()
        .map(|m| {
            let defaults: Map<String, Value> = m
                .defaults
                .iter()
                .copied()
                .map(|(k, v)| {
                    let value = serde_json::from_str(v).unwrap_or_else(|_| json!(v));
                    (k.to_string(), value)
                })
                .collect();
            json!({
                "name": m.name,
                "args": m.args,
                "defaults": defaults,
                "docstring": m.doc,
                "needs_authentication": m.needs_authentication,
            })
        })
        .collect();
    Json(json!(methods))
}

async fn rpc_post(State(state): State<Arc<RpcState>>, body: String) -> Json<Value> {
    let request: RpcRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(err) => return Json(exception("BadRequest", &err.to_string())),
    };
    let Some(spec) = METHODS.iter().find(|m| m.name == request.method) else {
        return Json(exception(
            "NameError",
            &format!("Method {} not found", request.method),
        ));
    };
    if request.args.len() > spec.args.len() {
        return Json(exception(
            "TypeError",
            &format!(
                "{} takes at most {} positional arguments",
                spec.name,
                spec.args.len()
            ),
        ));
    }

    let mut params = Map::new();
    for (name, value) in spec.args.iter().zip(request.args) {
        let _ = params.insert((*name).to_string(), value);
    }
    for (key, value) in request.kwargs {
        let _ = params.insert(key, value);
    }

    let caller = if spec.needs_authentication {
        match authenticate(&state.users, request.auth.as_ref()) {
            Ok(caller) => Some(caller),
            Err(message) => {
                return Json(json!({
                    "status": "autherror",
                    "result": { "message": message },
                }))
            }
        }
    } else {
        None
    };

    match dispatch(&state.service, caller.as_ref(), spec.name, &params) {
        Ok(result) => Json(json!({ "status": "success", "result": result })),
        Err(err) => Json(exception(err.class(), &err.to_string())),
    }
}

fn exception(class: &str, message: &str) -> Value {
    json!({
        "status": "exception",
        "result": { "class": class, "message": message },
    })
}

fn authenticate(users: &[UserConfig], auth: Option<&(String, String)>) -> Result<Caller, String> {
    let Some((name, token)) = auth else {
        return Err("Authentication data not present".to_string());
    };
    match users.iter().find(|u| u.name == *name) {
        Some(user) if user.token == *token => Ok(Caller {
            name: user.name.clone(),
            staff: user.staff,
        }),
        Some(_) => Err("Invalid credentials".to_string()),
        None => Err(format!("User {name} does not exist")),
    }
}

fn dispatch(
    service: &PoolService,
    caller: Option<&Caller>,
    method: &str,
    params: &Map<String, Value>,
) -> ViveroResult<Value> {
    match method {
        "request_appliances" => {
            let caller = need_caller(caller, method)?;
            let request = PoolRequest {
                group: str_param(params, "group")?,
                count: u32_param(params, "count", 1)?,
                lease_minutes: u32_param(params, "lease_time", 60)?,
                template: opt_str_param(params, "template"),
                provider: opt_str_param(params, "provider"),
                version: opt_str_param(params, "version"),
                date: date_param(params, "date")?,
                preconfigured: bool_param(params, "preconfigured", true)?,
                yum_update: bool_param(params, "yum_update", false)?,
            };
            service.request_appliances(caller, request).map(|id| json!(id.0))
        }
        "request_check" => service.request_check(pool_param(params, "request_id")?),
        "prolong_appliance_lease" => {
            let caller = need_caller(caller, method)?;
            service.prolong_appliance_lease(
                caller,
                &ident_param(params, "id")?,
                u32_param(params, "minutes", 60)?,
            )
        }
        "prolong_appliance_pool_lease" => {
            let caller = need_caller(caller, method)?;
            service
                .prolong_appliance_pool_lease(
                    caller,
                    pool_param(params, "id")?,
                    u32_param(params, "minutes", 60)?,
                )
                .map(|()| json!(true))
        }
        "destroy_pool" => {
            let caller = need_caller(caller, method)?;
            service
                .destroy_pool(caller, pool_param(params, "id")?)
                .map(|()| json!(true))
        }
        "pool_exists" => Ok(json!(service.pool_exists(pool_param(params, "id")?))),
        "set_pool_description" => {
            let caller = need_caller(caller, method)?;
            service
                .set_pool_description(
                    caller,
                    pool_param(params, "id")?,
                    &str_param(params, "description")?,
                )
                .map(|()| json!(true))
        }
        "get_pool_description" => service
            .get_pool_description(pool_param(params, "id")?)
            .map(|d| json!(d)),
        "find_pools_by_description" => Ok(json!(
            service.find_pools_by_description(&str_param(params, "description")?)
        )),
        "list_appliances" => Ok(json!(
            service.list_appliances(opt_str_param(params, "owner").as_deref())
        )),
        "num_shepherd_appliances" => Ok(json!(
            service.num_shepherd_appliances(opt_str_param(params, "group").as_deref())
        )),
        "get_number_free_appliances" => service
            .get_number_free_appliances(&str_param(params, "group")?)
            .map(|n| json!(n)),
        "set_number_free_appliances" => {
            let caller = need_caller(caller, method)?;
            service
                .set_number_free_appliances(
                    caller,
                    &str_param(params, "group")?,
                    u32_param(params, "n", 0)?,
                )
                .map(|()| json!(true))
        }
        "available_cfme_versions" => Ok(json!(service.available_cfme_versions(
            opt_str_param(params, "group").as_deref(),
            bool_param(params, "preconfigured", true)?,
        ))),
        "available_groups" => Ok(json!(service.available_groups())),
        "available_providers" => Ok(json!(service.available_providers())),
        "add_provider" => {
            let caller = need_caller(caller, method)?;
            service
                .add_provider(caller, &str_param(params, "provider_key")?)
                .map(|added| json!(added))
        }
        "destroy_appliance" => {
            let caller = need_caller(caller, method)?;
            service
                .kill_appliance(caller, &ident_param(params, "id")?)
                .map(|marked| json!(marked))
        }
        "power_on" => {
            let caller = need_caller(caller, method)?;
            service
                .power_on(caller, &ident_param(params, "id")?)
                .map(|()| json!(true))
        }
        "power_off" => {
            let caller = need_caller(caller, method)?;
            service
                .power_off(caller, &ident_param(params, "id")?)
                .map(|()| json!(true))
        }
        "suspend" => {
            let caller = need_caller(caller, method)?;
            service
                .suspend(caller, &ident_param(params, "id")?)
                .map(|()| json!(true))
        }
        "power_state" => service
            .power_state(&ident_param(params, "id")?)
            .map(|s| json!(s)),
        other => Err(ViveroError::Invalid {
            field: "method".to_string(),
            message: format!("{other} is documented but not dispatched"),
        }),
    }
}

fn need_caller<'a>(caller: Option<&'a Caller>, method: &str) -> ViveroResult<&'a Caller> {
    caller.ok_or_else(|| ViveroError::AuthRequired {
        method: method.to_string(),
    })
}

fn param<'a>(params: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    params.get(key).filter(|v| !v.is_null())
}

fn str_param(params: &Map<String, Value>, key: &str) -> ViveroResult<String> {
    param(params, key)
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| ViveroError::Invalid {
            field: key.to_string(),
            message: "expected a string".to_string(),
        })
}

fn opt_str_param(params: &Map<String, Value>, key: &str) -> Option<String> {
    param(params, key)
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

fn u32_param(params: &Map<String, Value>, key: &str, default: u32) -> ViveroResult<u32> {
    match param(params, key) {
        None => Ok(default),
        Some(value) => value
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| ViveroError::Invalid {
                field: key.to_string(),
                message: "expected a non-negative integer".to_string(),
            }),
    }
}

fn bool_param(params: &Map<String, Value>, key: &str, default: bool) -> ViveroResult<bool> {
    match param(params, key) {
        None => Ok(default),
        Some(value) => value.as_bool().ok_or_else(|| ViveroError::Invalid {
            field: key.to_string(),
            message: "expected a boolean".to_string(),
        }),
    }
}

fn date_param(params: &Map<String, Value>, key: &str) -> ViveroResult<Option<NaiveDate>> {
    match param(params, key) {
        None => Ok(None),
        Some(value) => {
            let raw = value.as_str().ok_or_else(|| ViveroError::Invalid {
                field: key.to_string(),
                message: "expected an ISO date string".to_string(),
            })?;
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map(Some)
                .map_err(|err| ViveroError::Invalid {
                    field: key.to_string(),
                    message: err.to_string(),
                })
        }
    }
}

fn pool_param(params: &Map<String, Value>, key: &str) -> ViveroResult<PoolId> {
    let value = param(params, key).ok_or_else(|| ViveroError::Invalid {
        field: key.to_string(),
        message: "expected a pool id".to_string(),
    })?;
    let id = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    };
    id.map(PoolId).ok_or_else(|| ViveroError::Invalid {
        field: key.to_string(),
        message: "expected a pool id".to_string(),
    })
}

fn ident_param(params: &Map<String, Value>, key: &str) -> ViveroResult<String> {
    let value = param(params, key).ok_or_else(|| ViveroError::Invalid {
        field: key.to_string(),
        message: "expected an appliance identifier".to_string(),
    })?;
    match value {
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => Ok(s.clone()),
        _ => Err(ViveroError::Invalid {
            field: key.to_string(),
            message: "expected an appliance identifier".to_string(),
        }),
    }
}
