use clap::Parser;
use review_etl::app::{self, App};
use review_etl::config::cli::{Cli, Command, LogFormat};
use review_etl::utils::error::{ErrorSeverity, Result};
use review_etl::utils::{logger, validation::Validate};
use review_etl::AppConfig;
use serde::Serialize;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // 初始化日誌
    match cli.log_format {
        LogFormat::Compact => logger::init_cli_logger(cli.verbose),
        LogFormat::Json => logger::init_json_logger(cli.verbose),
    }

    tracing::info!("🚀 Starting review-etl");
    tracing::info!("📁 Loading configuration from: {}", cli.config.display());

    let config = match AppConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Failed to load config file '{}': {}", cli.config.display(), e);
            eprintln!("💡 Make sure the file is valid TOML format");
            std::process::exit(1);
        }
    };
    if cli.verbose {
        tracing::debug!("Config: {:?}", config);
    }

    // 驗證配置
    if let Err(e) = config.validate() {
        tracing::error!("❌ Configuration validation failed: {}", e);
        tracing::error!("💡 Suggestion: {}", e.recovery_suggestion());
        eprintln!("❌ {}", e.user_friendly_message());
        std::process::exit(1);
    }

    if let Err(e) = execute(cli.command, &config).await {
        tracing::error!(
            "❌ Command failed: {} (Category: {:?}, Severity: {:?})",
            e,
            e.category(),
            e.severity()
        );
        tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());

        eprintln!("❌ {}", e.user_friendly_message());
        eprintln!("💡 建議: {}", e.recovery_suggestion());

        // 根據錯誤嚴重程度決定退出碼
        let exit_code = match e.severity() {
            ErrorSeverity::Low => 0,      // 警告，但成功
            ErrorSeverity::Medium => 2,   // 重試錯誤
            ErrorSeverity::High => 1,     // 處理錯誤
            ErrorSeverity::Critical => 3, // 系統錯誤
        };
        if exit_code > 0 {
            std::process::exit(exit_code);
        }
    }

    Ok(())
}

async fn execute(command: Command, config: &AppConfig) -> Result<()> {
    let app = app::build(config).await?;
    match command {
        Command::Run => run_forever(&app).await?,
        Command::Process => {
            let summary = app.scheduler.trigger_now().await?;
            app.metrics.log_summary();
            print_json(&summary)?;
        }
        Command::Cleanup => print_json(&app.scheduler.trigger_cleanup_now().await?)?,
        Command::Status { id } => print_json(&app.orchestrator().status(id).await?)?,
        Command::List { status, limit } => {
            print_json(&app.orchestrator().list_statuses(status, limit).await?)?
        }
        Command::Retry { id } => print_json(&app.orchestrator().retry(id).await?)?,
        Command::Stop { id } => print_json(&app.orchestrator().stop(id).await?)?,
        Command::Stats => print_json(&app.orchestrator().provider_statistics().await?)?,
        Command::Health => {
            let healthy = app.scheduler.health_check().await?;
            println!("{}", if healthy { "✅ healthy" } else { "⚠️ lock busy" });
        }
    }
    Ok(())
}

async fn run_forever(app: &App) -> Result<()> {
    if !app.scheduler.health_check().await? {
        tracing::warn!("Lock backend answered but the health check key is busy");
    }

    let handle = app.scheduler.start();
    tokio::signal::ctrl_c().await?;
    tracing::info!("🛑 Shutdown requested, waiting for in-flight work");
    handle.shutdown().await;

    app.metrics.log_summary();
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
