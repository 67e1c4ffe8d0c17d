use anyhow::{Context, Result};
use clap::Parser;
use gkemd_agent::config::{ConfigManager, NodeEnvironment};
use gkemd_agent::Agent;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// GKE 元数据服务模拟器节点代理
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// 配置文件路径（YAML 或 JSON）
    #[arg(short, long, env = "GKEMD_CONFIG_FILE")]
    config: Option<String>,

    /// 日志级别，覆盖配置文件中的 log_level
    #[arg(long)]
    log_level: Option<String>,

    /// 输出生效的配置后退出
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let manager = ConfigManager::new(cli.config.as_deref())?;
    let mut config = manager.get_config().clone();
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    if cli.print_config {
        print!("{}", config.to_yaml()?);
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!(path = ?manager.config_path(), log_level = %config.log_level, "配置加载完成");

    let env = NodeEnvironment::from_env()?;
    let agent = Agent::new(config, env).await?;
    agent.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("等待退出信号失败")?;
    info!("收到退出信号，开始关闭");
    agent.stop().await;

    Ok(())
}
