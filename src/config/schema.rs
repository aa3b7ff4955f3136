//! Store config validation
//!
//! One validator per config shape. The shape is picked by the presence of the
//! `connectionString` key; each validator rejects keys outside its own set.

use serde_json::{Map, Value};

use super::template::is_template;
use super::types::{
    ConnectionStringConfig, DiscreteConfig, PortSetting, SslMode, StoreConfig, TunnelConfig,
    DEFAULT_SSH_PORT,
};
use crate::error::KvError;

const CONNECTION_STRING_KEYS: &[&str] = &["connectionString", "in_vpc", "tunnel"];

const DISCRETE_KEYS: &[&str] = &[
    "host", "port", "user", "password", "database", "ssl", "in_vpc", "tunnel",
];

const TUNNEL_KEYS: &[&str] = &["user", "host", "port", "private_key"];

/// Validate a raw store config.
///
/// With `allow_templates`, fields that cannot hold a template literally
/// (`port`, `tunnel.port`) accept an unresolved `{{ VAR }}` placeholder.
pub fn validate(raw: &Value, allow_templates: bool) -> Result<StoreConfig, KvError> {
    let obj = match raw {
        Value::Object(obj) if !obj.is_empty() => obj,
        Value::Object(_) | Value::Null => return Err(KvError::invalid("empty")),
        _ => return Err(KvError::invalid("must be an object")),
    };

    if obj.contains_key("connectionString") {
        validate_connection_string_shape(obj, allow_templates).map(StoreConfig::ConnectionString)
    } else {
        validate_discrete_shape(obj, allow_templates).map(StoreConfig::Discrete)
    }
}

fn reject_unknown_keys(obj: &Map<String, Value>, allowed: &[&str]) -> Result<(), KvError> {
    match obj.keys().find(|key| !allowed.contains(&key.as_str())) {
        Some(key) => Err(KvError::invalid(format!("Invalid key \"{}\"", key))),
        None => Ok(()),
    }
}

fn validate_connection_string_shape(
    obj: &Map<String, Value>,
    allow_templates: bool,
) -> Result<ConnectionStringConfig, KvError> {
    reject_unknown_keys(obj, CONNECTION_STRING_KEYS)?;

    let connection_string = match obj.get("connectionString") {
        Some(Value::String(s)) => s.clone(),
        _ => {
            return Err(KvError::invalid("if provided, must be a string").within("connectionString"))
        }
    };

    Ok(ConnectionStringConfig {
        connection_string,
        in_vpc: validate_in_vpc(obj.get("in_vpc")).map_err(|e| e.within("in_vpc"))?,
        tunnel: validate_tunnel(obj.get("tunnel"), allow_templates).map_err(|e| e.within("tunnel"))?,
    })
}

fn validate_discrete_shape(
    obj: &Map<String, Value>,
    allow_templates: bool,
) -> Result<DiscreteConfig, KvError> {
    reject_unknown_keys(obj, DISCRETE_KEYS)?;

    let host = match obj.get("host") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        _ => return Err(KvError::invalid("must be a non-empty string").within("host")),
    };

    Ok(DiscreteConfig {
        host,
        port: validate_port(obj.get("port"), allow_templates).map_err(|e| e.within("port"))?,
        user: coerce_string(obj.get("user")).map_err(|e| e.within("user"))?,
        password: validate_password(obj.get("password")).map_err(|e| e.within("password"))?,
        database: coerce_string(obj.get("database")).map_err(|e| e.within("database"))?,
        ssl: validate_ssl(obj.get("ssl")).map_err(|e| e.within("ssl"))?,
        in_vpc: validate_in_vpc(obj.get("in_vpc")).map_err(|e| e.within("in_vpc"))?,
        tunnel: validate_tunnel(obj.get("tunnel"), allow_templates).map_err(|e| e.within("tunnel"))?,
    })
}

/// Port coerced to an integer in [1, 65535]; numeric strings are accepted
fn validate_port(value: Option<&Value>, allow_templates: bool) -> Result<PortSetting, KvError> {
    let out_of_range = || KvError::invalid("must be between 1 - 65535");
    let port = match value {
        Some(Value::String(s)) if allow_templates && is_template(s) => {
            return Ok(PortSetting::Template(s.clone()))
        }
        Some(value) => whole_number(value).ok_or_else(out_of_range)?,
        None => return Err(out_of_range()),
    };
    match u16::try_from(port) {
        Ok(port) if port >= 1 => Ok(PortSetting::Number(port)),
        _ => Err(out_of_range()),
    }
}

/// Non-negative whole number; `6379.0` and `"6379.0"` count, `6379.5` does not
fn whole_number(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && (0.0..=f64::from(u16::MAX)).contains(f))
                .map(|f| f as u64)
        }),
        Value::String(s) => {
            let s = s.trim();
            let whole = match s.split_once('.') {
                Some((whole, fraction))
                    if !fraction.is_empty() && fraction.bytes().all(|b| b == b'0') =>
                {
                    whole
                }
                Some(_) => return None,
                None => s,
            };
            whole.parse().ok()
        }
        _ => None,
    }
}

fn validate_password(value: Option<&Value>) -> Result<String, KvError> {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => Ok(String::new()),
        Some(Value::String(s)) => Ok(s.clone()),
        _ => Err(KvError::invalid("if provided, must be a string")),
    }
}

/// `user` and `database` are coerced to strings; absent or falsy becomes empty
fn coerce_string(value: Option<&Value>) -> Result<String, KvError> {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => Ok(String::new()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::Bool(true)) => Ok("true".to_string()),
        Some(_) => Err(KvError::invalid("must be a string")),
    }
}

fn validate_ssl(value: Option<&Value>) -> Result<SslMode, KvError> {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => Ok(SslMode::Disabled),
        Some(Value::Bool(true)) => Ok(SslMode::Enabled),
        Some(Value::String(s)) if s == "unauthorized" => Ok(SslMode::Unauthorized),
        Some(Value::Object(obj))
            if obj.len() == 1 && obj.get("rejectUnauthorized") == Some(&Value::Bool(false)) =>
        {
            Ok(SslMode::Unauthorized)
        }
        _ => Err(KvError::invalid(
            "if provided, must be true, false or \"unauthorized\"",
        )),
    }
}

fn validate_in_vpc(value: Option<&Value>) -> Result<bool, KvError> {
    match value {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        _ => Err(KvError::invalid("must be true or false")),
    }
}

fn validate_tunnel(
    value: Option<&Value>,
    allow_templates: bool,
) -> Result<Option<TunnelConfig>, KvError> {
    let obj = match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => return Ok(None),
        Some(Value::Object(obj)) => obj,
        Some(_) => return Err(KvError::invalid("SSH tunnel must be an object")),
    };
    reject_unknown_keys(obj, TUNNEL_KEYS)?;

    let required = |key: &str| match obj.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        _ => Err(KvError::invalid(format!("Missing or invalid SSH tunnel \"{}\"", key)).within(key)),
    };
    let user = required("user")?;
    let host = required("host")?;

    let port = match obj.get("port") {
        None | Some(Value::Null) => PortSetting::Number(DEFAULT_SSH_PORT),
        value => validate_port(value, allow_templates).map_err(|e| e.within("port"))?,
    };

    let private_key = match obj.get("private_key") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            return Err(KvError::invalid("Invalid SSH tunnel \"private_key\"").within("private_key"))
        }
    };

    Ok(Some(TunnelConfig {
        user,
        host,
        port,
        private_key,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_connection_string_shape() {
        let cfg = validate(&json!({"connectionString": "redis://localhost:6379"}), false).unwrap();
        assert_eq!(cfg.connection_string(), Some("redis://localhost:6379"));
        assert!(!cfg.in_vpc());
    }

    #[test]
    fn test_discrete_defaults() {
        let cfg = validate(&json!({"host": "localhost", "port": "1111"}), false).unwrap();
        match cfg {
            StoreConfig::Discrete(d) => {
                assert_eq!(d.port, PortSetting::Number(1111));
                assert_eq!(d.password, "");
                assert_eq!(d.user, "");
                assert_eq!(d.ssl, SslMode::Disabled);
                assert!(d.tunnel.is_none());
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = validate(&json!({"host": "localhost", "port": 6379, "colour": "red"}), false)
            .unwrap_err();
        assert!(matches!(err, KvError::ConfigInvalid { .. }));
        assert!(err.to_string().contains("Invalid key \"colour\""));
    }

    #[test]
    fn test_shapes_do_not_mix() {
        let err = validate(
            &json!({"connectionString": "redis://localhost:6379", "host": "other"}),
            false,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Invalid key \"host\""));
    }

    #[test]
    fn test_port_range() {
        for bad in [json!(0), json!(65536), json!(1.5), json!("abc"), json!(-1)] {
            let err = validate(&json!({"host": "localhost", "port": bad}), false).unwrap_err();
            assert_eq!(err.path(), Some("[\"port\"]"));
        }
        assert!(validate(&json!({"host": "h", "port": 65535}), false).is_ok());
    }

    #[test]
    fn test_whole_float_port_accepted() {
        for port in [json!(6379.0), json!("6379.0"), json!(" 6379 ")] {
            let cfg = validate(&json!({"host": "h", "port": port}), false).unwrap();
            match cfg {
                StoreConfig::Discrete(d) => assert_eq!(d.port, PortSetting::Number(6379)),
                other => panic!("unexpected shape: {:?}", other),
            }
        }
        for bad in [json!(6379.5), json!("6379.5"), json!("6379."), json!(65536.0)] {
            assert!(validate(&json!({"host": "h", "port": bad}), false).is_err());
        }
    }

    #[test]
    fn test_any_delimited_port_is_a_template() {
        let raw = json!({"host": "h", "port": "{{ MY PORT }}"});
        match validate(&raw, true).unwrap() {
            StoreConfig::Discrete(d) => {
                assert_eq!(d.port, PortSetting::Template("{{ MY PORT }}".into()))
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn test_port_template_only_when_allowed() {
        let raw = json!({"host": "localhost", "port": "{{ KV_PORT }}"});
        let cfg = validate(&raw, true).unwrap();
        match cfg {
            StoreConfig::Discrete(d) => {
                assert_eq!(d.port, PortSetting::Template("{{ KV_PORT }}".into()))
            }
            other => panic!("unexpected shape: {:?}", other),
        }
        assert!(validate(&raw, false).is_err());
    }

    #[test]
    fn test_ssl_values() {
        let ok = |ssl: Value| validate(&json!({"host": "h", "port": 1, "ssl": ssl}), false);
        assert!(ok(json!(true)).is_ok());
        assert!(ok(json!("unauthorized")).is_ok());
        assert!(ok(json!({"rejectUnauthorized": false})).is_ok());
        let err = ok(json!("yes")).unwrap_err();
        assert_eq!(err.path(), Some("[\"ssl\"]"));
    }

    #[test]
    fn test_user_and_database_coerced() {
        let cfg = validate(&json!({"host": "h", "port": 1, "user": 42, "database": 0}), false)
            .unwrap();
        match cfg {
            StoreConfig::Discrete(d) => {
                assert_eq!(d.user, "42");
                assert_eq!(d.database, "0");
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn test_tunnel_requires_user_and_host() {
        let err = validate(
            &json!({"host": "h", "port": 1, "tunnel": {"host": "bastion"}}),
            false,
        )
        .unwrap_err();
        assert_eq!(err.path(), Some("[\"tunnel\"][\"user\"]"));

        let err = validate(
            &json!({"connectionString": "x", "tunnel": {"user": "deploy", "host": ""}}),
            false,
        )
        .unwrap_err();
        assert_eq!(err.path(), Some("[\"tunnel\"][\"host\"]"));
    }

    #[test]
    fn test_tunnel_defaults_port() {
        let cfg = validate(
            &json!({"host": "h", "port": 1, "tunnel": {"user": "deploy", "host": "bastion"}}),
            false,
        )
        .unwrap();
        let tunnel = cfg.tunnel().unwrap();
        assert_eq!(tunnel.port, PortSetting::Number(22));
        assert!(tunnel.private_key.is_none());
    }

    #[test]
    fn test_empty_config_rejected() {
        assert!(validate(&json!({}), false).is_err());
        assert!(validate(&Value::Null, false).is_err());
        assert!(validate(&json!("redis://localhost:6379"), false).is_err());
    }
}
