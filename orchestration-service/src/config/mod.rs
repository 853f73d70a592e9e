use crate::models::{AlertThresholds, ServiceKind};
use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::time::Duration;

const DEFAULT_NUTRITION_BASE_URL: &str = "https://api.spoonacular.com";
const DEFAULT_GENAI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_PAYMENT_BASE_URL: &str = "https://api.stripe.com/v1";
const DEFAULT_IDENTITY_BASE_URL: &str = "http://localhost:54321";
const DEFAULT_HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub common: core_config::Config,
    pub mongodb: MongoConfig,
    pub services: ServicesConfig,
    pub budget: BudgetConfig,
    pub cache: CacheConfig,
    pub audit: AuditConfig,
    pub consent: ConsentConfig,
    /// Upper bound for each individual health probe.
    pub health_probe_timeout: Duration,
    /// Deadline for each billable upstream call; none when unset.
    pub call_timeout: Option<Duration>,
    /// Key for the operator routes; they refuse everything when unset.
    pub admin_api_key: Option<Secret<String>>,
    pub otlp_endpoint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MongoConfig {
    pub uri: String,
    pub database: String,
}

/// Connection and metering settings shared by every upstream service.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// The service counts as configured iff this is present.
    pub api_key: Option<Secret<String>>,
    pub base_url: String,
    /// `0` disables rate limiting for the service.
    pub requests_per_minute: u32,
    /// Price recorded for every call that reaches the upstream.
    pub cost_per_call_usd: f64,
}

impl ServiceSettings {
    fn unconfigured(base_url: &str, requests_per_minute: u32, cost_per_call_usd: f64) -> Self {
        Self {
            api_key: None,
            base_url: base_url.to_string(),
            requests_per_minute,
            cost_per_call_usd,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(Secret::new(api_key.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct GenAiSettings {
    pub service: ServiceSettings,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Provider safety-filter threshold, e.g. `BLOCK_MEDIUM_AND_ABOVE`.
    pub safety_threshold: String,
}

#[derive(Debug, Clone)]
pub struct ServicesConfig {
    pub nutrition: ServiceSettings,
    pub genai: GenAiSettings,
    pub payment: ServiceSettings,
    pub identity: ServiceSettings,
}

impl Default for ServicesConfig {
    /// Default endpoints and limits with no credentials, i.e. nothing configured.
    fn default() -> Self {
        Self {
            nutrition: ServiceSettings::unconfigured(DEFAULT_NUTRITION_BASE_URL, 60, 0.002),
            genai: GenAiSettings {
                service: ServiceSettings::unconfigured(DEFAULT_GENAI_BASE_URL, 30, 0.01),
                model: "gemini-2.0-flash".to_string(),
                temperature: 0.7,
                max_tokens: 2048,
                safety_threshold: "BLOCK_MEDIUM_AND_ABOVE".to_string(),
            },
            payment: ServiceSettings::unconfigured(DEFAULT_PAYMENT_BASE_URL, 100, 0.0),
            identity: ServiceSettings::unconfigured(DEFAULT_IDENTITY_BASE_URL, 300, 0.0),
        }
    }
}

impl ServicesConfig {
    /// Give every service the same credential, marking all four configured.
    pub fn with_api_keys(mut self, api_key: &str) -> Self {
        self.nutrition = self.nutrition.with_api_key(api_key);
        self.genai.service = self.genai.service.with_api_key(api_key);
        self.payment = self.payment.with_api_key(api_key);
        self.identity = self.identity.with_api_key(api_key);
        self
    }

    pub fn settings_mut(&mut self, service: ServiceKind) -> &mut ServiceSettings {
        match service {
            ServiceKind::Nutrition => &mut self.nutrition,
            ServiceKind::GenerativeAi => &mut self.genai.service,
            ServiceKind::Payment => &mut self.payment,
            ServiceKind::Identity => &mut self.identity,
        }
    }

    pub fn settings(&self, service: ServiceKind) -> &ServiceSettings {
        match service {
            ServiceKind::Nutrition => &self.nutrition,
            ServiceKind::GenerativeAi => &self.genai.service,
            ServiceKind::Payment => &self.payment,
            ServiceKind::Identity => &self.identity,
        }
    }

    /// Requests-per-minute limit of every service.
    pub fn rate_limits(&self) -> HashMap<ServiceKind, u32> {
        ServiceKind::ALL
            .iter()
            .map(|service| (*service, self.settings(*service).requests_per_minute))
            .collect()
    }

    /// Per-call price of every service.
    pub fn prices(&self) -> HashMap<ServiceKind, f64> {
        ServiceKind::ALL
            .iter()
            .map(|service| (*service, self.settings(*service).cost_per_call_usd))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct BudgetConfig {
    pub monthly_budget_usd: f64,
    /// Optional per-service ceilings within the monthly budget.
    pub service_budgets_usd: BTreeMap<ServiceKind, f64>,
    pub alert_thresholds: AlertThresholds,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            monthly_budget_usd: 50.0,
            service_budgets_usd: BTreeMap::new(),
            alert_thresholds: AlertThresholds::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub max_entries: usize,
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            max_entries: 1000,
            sweep_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuditConfig {
    /// Audit successful operations even when they touch no PHI.
    pub audit_all: bool,
    /// Operations slower than this carry the `SLOW_QUERY` flag.
    pub slow_query_threshold: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct ConsentConfig {
    /// When set, only grants against this disclaimer version count.
    pub disclaimer_version: Option<String>,
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            uri: "mongodb://localhost:27017".to_string(),
            database: "care_orchestration".to_string(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            common: core_config::Config::default(),
            mongodb: MongoConfig::default(),
            services: ServicesConfig::default(),
            budget: BudgetConfig::default(),
            cache: CacheConfig::default(),
            audit: AuditConfig::default(),
            consent: ConsentConfig::default(),
            health_probe_timeout: DEFAULT_HEALTH_PROBE_TIMEOUT,
            call_timeout: None,
            admin_api_key: None,
            otlp_endpoint: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn load() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;
        let is_prod = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()) == "prod";

        let defaults = ServicesConfig::default();
        let nutrition = load_service(ServiceKind::Nutrition, &defaults.nutrition)?;
        let genai = GenAiSettings {
            service: load_service(ServiceKind::GenerativeAi, &defaults.genai.service)?,
            model: get_env("GENAI_MODEL", Some(defaults.genai.model.as_str()), is_prod)?,
            temperature: parse_env("GENAI_TEMPERATURE", defaults.genai.temperature)?,
            max_tokens: parse_env("GENAI_MAX_TOKENS", defaults.genai.max_tokens)?,
            safety_threshold: get_env(
                "GENAI_SAFETY_THRESHOLD",
                Some(defaults.genai.safety_threshold.as_str()),
                false,
            )?,
        };
        let payment = load_service(ServiceKind::Payment, &defaults.payment)?;
        let identity = load_service(ServiceKind::Identity, &defaults.identity)?;

        let mut service_budgets_usd = BTreeMap::new();
        for service in ServiceKind::ALL {
            let key = format!("BUDGET_{}_USD", service.env_prefix());
            if let Some(limit) = optional_parse::<f64>(&key)? {
                service_budgets_usd.insert(service, limit);
            }
        }

        Ok(OrchestratorConfig {
            common: common_config,
            mongodb: MongoConfig {
                uri: get_env("MONGODB_URI", Some("mongodb://localhost:27017"), is_prod)?,
                database: get_env("MONGODB_DATABASE", Some("care_orchestration"), is_prod)?,
            },
            services: ServicesConfig {
                nutrition,
                genai,
                payment,
                identity,
            },
            budget: BudgetConfig {
                monthly_budget_usd: parse_env("BUDGET_MONTHLY_USD", 50.0)?,
                service_budgets_usd,
                alert_thresholds: parse_thresholds(env::var("BUDGET_ALERT_THRESHOLDS").ok())?,
            },
            cache: CacheConfig {
                ttl: Duration::from_secs(parse_env("CACHE_TTL_SECS", 3600)?),
                max_entries: parse_env("CACHE_MAX_ENTRIES", 1000)?,
                sweep_interval: Duration::from_secs(parse_env("CACHE_SWEEP_INTERVAL_SECS", 300)?),
            },
            audit: AuditConfig {
                audit_all: parse_env("AUDIT_ALL", false)?,
                slow_query_threshold: optional_parse::<u64>("AUDIT_SLOW_QUERY_MS")?
                    .map(Duration::from_millis),
            },
            consent: ConsentConfig {
                disclaimer_version: env::var("CONSENT_DISCLAIMER_VERSION").ok(),
            },
            health_probe_timeout: optional_parse::<u64>("HEALTH_PROBE_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_HEALTH_PROBE_TIMEOUT),
            call_timeout: optional_parse::<u64>("EXTERNAL_CALL_TIMEOUT_MS")?
                .map(Duration::from_millis),
            admin_api_key: load_admin_key(is_prod)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
        })
    }
}

/// Required in production; optional elsewhere, where its absence simply
/// disables the operator routes.
fn load_admin_key(is_prod: bool) -> Result<Option<Secret<String>>, AppError> {
    match env::var("ADMIN_API_KEY") {
        Ok(key) if !key.trim().is_empty() => Ok(Some(Secret::new(key))),
        _ if is_prod => Err(AppError::ConfigError(anyhow::anyhow!(
            "ADMIN_API_KEY is required in production but not set"
        ))),
        _ => Ok(None),
    }
}

fn load_service(
    service: ServiceKind,
    defaults: &ServiceSettings,
) -> Result<ServiceSettings, AppError> {
    let prefix = service.env_prefix();
    let key_var = match service {
        ServiceKind::Payment => "PAYMENT_SECRET_KEY".to_string(),
        ServiceKind::Identity => "IDENTITY_API_KEY".to_string(),
        _ => format!("{}_API_KEY", prefix),
    };
    let url_var = match service {
        ServiceKind::Identity => "IDENTITY_URL".to_string(),
        _ => format!("{}_BASE_URL", prefix),
    };

    Ok(ServiceSettings {
        api_key: env::var(&key_var)
            .ok()
            .filter(|s| !s.is_empty())
            .map(Secret::new),
        base_url: env::var(&url_var).unwrap_or_else(|_| defaults.base_url.clone()),
        requests_per_minute: parse_env(
            &format!("{}_REQUESTS_PER_MINUTE", prefix),
            defaults.requests_per_minute,
        )?,
        cost_per_call_usd: parse_env(
            &format!("COST_{}_PER_CALL_USD", prefix),
            defaults.cost_per_call_usd,
        )?,
    })
}

/// Parse `"50,75,90"` into alert thresholds. 100% is implicit.
fn parse_thresholds(raw: Option<String>) -> Result<AlertThresholds, AppError> {
    let Some(raw) = raw else {
        return Ok(AlertThresholds::default());
    };

    let values = raw
        .split(',')
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<f64>().map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!(
                    "BUDGET_ALERT_THRESHOLDS contains invalid value '{}': {}",
                    part,
                    e
                ))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    match values.as_slice() {
        [warning, elevated, critical, ..]
            if warning <= elevated && elevated <= critical && *critical <= 100.0 =>
        {
            Ok(AlertThresholds {
                warning_pct: *warning,
                elevated_pct: *elevated,
                critical_pct: *critical,
            })
        }
        _ => Err(AppError::ConfigError(anyhow::anyhow!(
            "BUDGET_ALERT_THRESHOLDS must list three ascending percentages, got '{}'",
            raw
        ))),
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    Ok(optional_parse(key)?.unwrap_or(default))
}

fn optional_parse<T>(key: &str) -> Result<Option<T>, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(val) if !val.trim().is_empty() => val.trim().parse::<T>().map(Some).map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!("{} has invalid value '{}': {}", key, val, e))
        }),
        _ => Ok(None),
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}
