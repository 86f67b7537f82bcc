use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize dotenv and structured tracing based on RUST_LOG.
/// - Supports explicit env file paths via ENV_FILE, DOTENV_PATH
/// - Falls back to the default .env discovery
/// - Logs the source used
pub fn init_tracing() {
    let mut env_source: String = "none".into();
    for key in ["ENV_FILE", "DOTENV_PATH"] {
        if let Ok(p) = std::env::var(key) {
            let p = p.trim();
            if !p.is_empty()
                && std::path::Path::new(p).is_file()
                && dotenvy::from_filename(p).is_ok()
            {
                env_source = format!("{p} ({key})");
                break;
            }
        }
    }

    if env_source == "none" && dotenvy::dotenv().is_ok() {
        env_source = ".env".into();
    }

    // Respects RUST_LOG potentially provided by the env file
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,llmrotor=info".into());
    let subscriber = fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    tracing::debug!("Environment loaded from: {}", env_source);
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn env_nonempty(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

/// reqwest client for provider calls.
///
/// `LLMROTOR_HTTP_TIMEOUT_SECONDS` sets a client-wide timeout on top of the
/// per-attempt deadline. `LLMROTOR_NO_PROXY` disables proxies; otherwise
/// `LLMROTOR_PROXY_URL`, `HTTP_PROXY` and `HTTPS_PROXY` are honored.
pub fn build_http_client_from_env() -> reqwest::Client {
    let mut builder = reqwest::Client::builder()
        .user_agent(format!("llmrotor/{}", env!("CARGO_PKG_VERSION")));

    if let Some(secs) = env_nonempty(&["LLMROTOR_HTTP_TIMEOUT_SECONDS"])
        .and_then(|v| v.parse::<u64>().ok())
    {
        builder = builder.timeout(Duration::from_secs(secs));
    }

    if env_flag("LLMROTOR_NO_PROXY") {
        return builder.no_proxy().build().unwrap_or_default();
    }

    let proxies = [
        env_nonempty(&["LLMROTOR_PROXY_URL"]).map(|u| reqwest::Proxy::all(u.as_str())),
        env_nonempty(&["HTTP_PROXY", "http_proxy"]).map(|u| reqwest::Proxy::http(u.as_str())),
        env_nonempty(&["HTTPS_PROXY", "https_proxy"]).map(|u| reqwest::Proxy::https(u.as_str())),
    ];
    for proxy in proxies.into_iter().flatten() {
        match proxy {
            Ok(proxy) => builder = builder.proxy(proxy),
            Err(err) => tracing::warn!(error = %err, "Ignoring invalid proxy URL"),
        }
    }

    builder.build().unwrap_or_default()
}

/// First 12 hex chars of the key's SHA-256. Safe to log.
pub fn key_fingerprint(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(12);
    hex
}

/// Chat-completions endpoint for a provider base URL.
pub fn completions_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else {
        format!("{base}/chat/completions")
    }
}

static ENV_REF: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").ok());

/// Replace `${VAR}` references using `lookup`; unset variables expand to "".
pub fn expand_env_vars<F>(raw: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    match ENV_REF.as_ref() {
        Some(re) => re
            .replace_all(raw, |caps: &regex::Captures<'_>| {
                lookup(&caps[1]).unwrap_or_default()
            })
            .into_owned(),
        None => raw.to_string(),
    }
}

static DURATION_PART: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)(ms|h|m|s)").ok());

/// Longest delay a provider can impose on a key through a rate-limit header.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

fn capped_secs(secs: f64) -> Option<Duration> {
    if secs.is_nan() || secs < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(secs.min(MAX_RETRY_AFTER.as_secs_f64())).ok()
}

/// Parse a duration such as "30", "1.5", "500ms", "20s", "2m" or "1m30s".
/// Bare numbers are seconds. Results are capped at [`MAX_RETRY_AFTER`].
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<f64>() {
        return capped_secs(secs);
    }

    let re = DURATION_PART.as_ref()?;
    let mut total = Duration::ZERO;
    let mut consumed = 0usize;
    for caps in re.captures_iter(s) {
        let whole = caps.get(0)?;
        if whole.start() != consumed {
            return None;
        }
        consumed = whole.end();

        let n: f64 = caps[1].parse().ok()?;
        let secs = match &caps[2] {
            "ms" => n / 1000.0,
            "s" => n,
            "m" => n * 60.0,
            "h" => n * 3600.0,
            _ => return None,
        };
        total = total.checked_add(capped_secs(secs)?)?.min(MAX_RETRY_AFTER);
    }
    (consumed == s.len()).then_some(total)
}

/// Delay requested by a 429 response, from `Retry-After` (seconds) or the
/// `x-ratelimit-reset-requests` style headers some providers send.
pub fn retry_after_from_headers(headers: &http::HeaderMap) -> Option<Duration> {
    ["retry-after", "x-ratelimit-reset-requests", "x-ratelimit-reset"]
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| value.to_str().ok())
        .find_map(parse_duration)
}
