use crate::{errors::ControllerError, retry::RetryPolicy};
use kube::{Api, Client};
use mywebapp_operator_apis::MyWebApp;
use std::{collections::HashSet, net::SocketAddr, str::FromStr, time::Duration};

pub(crate) const DEFAULT_IMAGE: &'static str = "nginx:latest";
pub(crate) const DEFAULT_REPLICAS: i32 = 1;

/// Values applied to a `MyWebApp` spec when a field is not declared.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct SpecDefaults {
    pub replicas: i32,
    pub image: String,
}

impl Default for SpecDefaults {
    fn default() -> Self {
        Self {
            replicas: DEFAULT_REPLICAS,
            image: DEFAULT_IMAGE.to_string(),
        }
    }
}

/// Plain configuration values, read once at startup.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Settings {
    /// `None` means all namespaces.
    pub watch_namespaces: Option<HashSet<String>>,
    pub resync_interval: Duration,
    pub retry: RetryPolicy,
    pub workers: usize,
    pub api_timeout: Duration,
    pub defaults: SpecDefaults,
    pub metrics_addr: SocketAddr,
}

impl Settings {
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(env_var)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn normalize(hs: HashSet<String>) -> Option<HashSet<String>> {
            if hs.is_empty() || hs.contains("*") || hs.contains("") {
                None
            } else {
                Some(hs)
            }
        }
        let watch_namespaces = lookup("WATCH_NAMESPACES")
            .map(|v| normalize(v.split(",").map(|v| v.trim().to_string()).collect()))
            .flatten();
        let resync_interval = Duration::from_secs(parse(&lookup, "RESYNC_INTERVAL_SECS", 300u64)?);
        let retry = RetryPolicy::new(
            Duration::from_millis(parse(&lookup, "RETRY_BACKOFF_MIN_MS", 500u64)?),
            Duration::from_millis(parse(&lookup, "RETRY_BACKOFF_MAX_MS", 300_000u64)?),
            parse(&lookup, "RETRY_JITTER", 0.1f64)?,
        );
        let workers = parse(&lookup, "RECONCILE_WORKERS", 4usize)?.max(1);
        let api_timeout = Duration::from_secs(parse(&lookup, "API_TIMEOUT_SECS", 30u64)?);
        let defaults = SpecDefaults {
            replicas: parse(&lookup, "DEFAULT_REPLICAS", DEFAULT_REPLICAS)?,
            image: lookup("DEFAULT_IMAGE").unwrap_or_else(|| DEFAULT_IMAGE.to_string()),
        };
        let metrics_addr = lookup("METRICS_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0".to_string());
        let metrics_port = lookup("METRICS_LISTEN_PORT").unwrap_or_else(|| "9000".to_string());
        let metrics_addr = format!("{}:{}", metrics_addr, metrics_port)
            .parse()
            .map_err(|e| {
                ControllerError::Contract(format!(
                    "invalid metrics listen address {}:{}: {}",
                    metrics_addr, metrics_port, e
                ))
            })?;
        if resync_interval.is_zero() {
            return Err(ControllerError::Contract(
                "RESYNC_INTERVAL_SECS must be greater than 0".to_string(),
            ));
        }
        Ok(Settings {
            watch_namespaces,
            resync_interval,
            retry,
            workers,
            api_timeout,
            defaults,
            metrics_addr,
        })
    }

    /// The single watched namespace, if exactly one is configured.
    pub fn single_namespace(&self) -> Option<&str> {
        let mut tmp = self.watch_namespaces.iter().flatten();
        match (tmp.next(), tmp.next()) {
            (Some(ns), None) => Some(ns.as_str()),
            _ => None,
        }
    }
}

/// Explicit context handed to every component constructor.
#[derive(Clone)]
pub(crate) struct Configuration {
    pub client: Client,
    pub webapps: Api<MyWebApp>,
    pub settings: Settings,
}

impl Configuration {
    pub fn new(client: Client, settings: Settings) -> Self {
        let webapps = if let Some(ns) = settings.single_namespace() {
            // Optimize for the use-case where exactly one watch-namespace is provided.
            info!("Controller is only watching MyWebApp resources in namespace {}", ns);
            Api::<MyWebApp>::namespaced(client.clone(), ns)
        } else {
            if let Some(namespaces) = &settings.watch_namespaces {
                let mut namespaces: Vec<&str> = namespaces.iter().map(|v| v.as_str()).collect();
                namespaces.sort();
                info!(
                    "Controller is watching MyWebApp resources in namespaces: {}",
                    namespaces.join(",")
                );
            } else {
                info!("Controller is watching MyWebApp resources in all namespaces");
            }
            Api::<MyWebApp>::all(client.clone())
        };
        Configuration {
            client,
            webapps,
            settings,
        }
    }
}

/// Whether `namespace` is within the watched namespaces, `None` watches all.
pub(crate) fn is_watched(namespaces: Option<&HashSet<String>>, namespace: &str) -> bool {
    namespaces.map_or(true, |v| v.contains(namespace))
}

pub(crate) fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse<F, T>(lookup: &F, name: &str, default: T) -> Result<T, ControllerError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(v) => v.parse::<T>().map_err(|e| {
            ControllerError::Contract(format!("invalid value {:?} for {}: {}", v, name, e))
        }),
        None => Ok(default),
    }
}
