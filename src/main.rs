use anyhow::Context;
use keycycle::config::{self, Config};
use keycycle::logging;
use keycycle::pool::CredentialPool;
use keycycle::usage::{cleanup_usage_files, open_store};
use keycycle::util::clock::SystemClock;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::load().context("加载配置失败")?;
    logging::init_tracing(cfg.log_level());

    let keys = config::load_api_keys(&cfg.provider)
        .with_context(|| format!("读取 {} 的 API key 失败", cfg.provider))?;

    if let Some(dir) = cfg.db_url.strip_prefix("jsonl://") {
        let today = chrono::Utc::now().date_naive();
        match cleanup_usage_files(dir, cfg.retention_days, today).await {
            Ok(0) => {}
            Ok(n) => tracing::info!("已清理 {n} 个过期 usage 分片"),
            Err(e) => tracing::warn!("清理 usage 分片失败: {e:#}"),
        }
    }

    let store = open_store(&cfg.db_url)
        .await
        .with_context(|| format!("打开 usage 存储失败: {}", cfg.db_url))?;
    let opts = cfg.pool_options(Arc::new(SystemClock))?;
    let pool = CredentialPool::new(keys, store, opts)
        .await
        .context("初始化凭据池失败")?;

    let global = pool.get_global_stats();
    println!(
        "{}",
        sonic_rs::to_string_pretty(&global).context("序列化统计失败")?
    );

    let model = pool.get_model_stats(&cfg.model);
    if !model.keys.is_empty() {
        println!(
            "{}",
            sonic_rs::to_string_pretty(&model).context("序列化统计失败")?
        );
    }

    let limits = pool.limits().resolve(pool.provider(), &cfg.model);
    tracing::info!(
        provider = %pool.provider(),
        model = %cfg.model,
        rpm = ?limits.requests_per_minute,
        tpm = ?limits.tokens_per_minute,
        "当前模型配额"
    );

    pool.stop().await;
    Ok(())
}
