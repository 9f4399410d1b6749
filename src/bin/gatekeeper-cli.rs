use clap::{Parser, Subcommand, ValueEnum};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{Map, Value};

#[derive(Parser)]
#[command(name = "gatekeeper-cli")]
#[command(about = "Management CLI for the gatekeeper admin API", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    #[arg(short, long, env = "GATEKEEPER_ADMIN_KEY")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check system status
    Status,
    /// Show quota config, usage and remaining for a credential
    Quota { credential: String },
    /// Update a credential's quota settings
    SetQuota {
        credential: String,
        /// Daily request limit ("unlimited" clears it)
        #[arg(long)]
        daily: Option<String>,
        /// Monthly request limit ("unlimited" clears it)
        #[arg(long)]
        monthly: Option<String>,
        #[arg(long)]
        throttle: Option<bool>,
        /// Priority 1-10 (higher means longer delays near the limit)
        #[arg(long)]
        priority: Option<u8>,
    },
    /// Revert a credential to the default quotas
    DeleteQuota { credential: String },
    /// Reset a credential's usage counters
    ResetQuota {
        credential: String,
        #[arg(long, value_enum, default_value_t = Period::All)]
        period: Period,
    },
    /// List credentials by current usage
    Usage {
        #[arg(long, value_enum, default_value_t = SortBy::Daily)]
        sort: SortBy,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// List circuit breakers
    Breakers,
    /// Breaker health summary
    BreakerSummary,
    /// Close a breaker and clear its history
    ResetBreaker { name: String },
    /// Drop aged history from every breaker
    Cleanup,
    /// Breaker history memory usage
    Memory,
}

#[derive(Clone, Copy, ValueEnum)]
enum SortBy {
    Daily,
    Monthly,
}

#[derive(Clone, Copy, ValueEnum)]
enum Period {
    Daily,
    Monthly,
    All,
}

impl Period {
    fn as_str(self) -> &'static str {
        match self {
            Period::Daily => "daily",
            Period::Monthly => "monthly",
            Period::All => "all",
        }
    }
}

fn limit_value(raw: &str) -> Result<Value, Box<dyn std::error::Error>> {
    if raw.eq_ignore_ascii_case("unlimited") {
        Ok(Value::Null)
    } else {
        Ok(Value::from(raw.parse::<u64>()?))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = cli.url.trim_end_matches('/');

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );

    let request = match cli.command {
        Commands::Status => client.get(format!("{}/admin/status", base)),
        Commands::Quota { credential } => {
            client.get(format!("{}/admin/quotas/{}", base, credential))
        }
        Commands::SetQuota {
            credential,
            daily,
            monthly,
            throttle,
            priority,
        } => {
            let mut body = Map::new();
            if let Some(daily) = daily {
                body.insert("daily_limit".into(), limit_value(&daily)?);
            }
            if let Some(monthly) = monthly {
                body.insert("monthly_limit".into(), limit_value(&monthly)?);
            }
            if let Some(throttle) = throttle {
                body.insert("throttle_enabled".into(), Value::from(throttle));
            }
            if let Some(priority) = priority {
                body.insert("priority".into(), Value::from(priority));
            }
            client
                .put(format!("{}/admin/quotas/{}", base, credential))
                .json(&Value::Object(body))
        }
        Commands::DeleteQuota { credential } => {
            client.delete(format!("{}/admin/quotas/{}", base, credential))
        }
        Commands::ResetQuota { credential, period } => client
            .post(format!("{}/admin/quotas/{}/reset", base, credential))
            .query(&[("period", period.as_str())]),
        Commands::Usage {
            sort,
            limit,
            offset,
        } => client.get(format!("{}/admin/quotas", base)).query(&[
            (
                "sort",
                match sort {
                    SortBy::Daily => "daily",
                    SortBy::Monthly => "monthly",
                }
                .to_string(),
            ),
            ("limit", limit.to_string()),
            ("offset", offset.to_string()),
        ]),
        Commands::Breakers => client.get(format!("{}/admin/breakers", base)),
        Commands::BreakerSummary => client.get(format!("{}/admin/breakers/summary", base)),
        Commands::ResetBreaker { name } => {
            client.post(format!("{}/admin/breakers/{}/reset", base, name))
        }
        Commands::Cleanup => client.post(format!("{}/admin/breakers/cleanup", base)),
        Commands::Memory => client.get(format!("{}/admin/breakers/memory", base)),
    };

    let res = request.headers(headers).send().await?;
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        std::process::exit(1);
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
