use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::time::{Duration, sleep};
use tracing::info;
use tracing_subscriber::EnvFilter;

use skein_core::app::{
    Computation, DependencyResult, EngineBuilder, EngineConfig, ResolvedDependencies,
    ServiceProcessor, WorkerGroup,
};
use skein_core::domain::{
    LifecycleStage, NotificationRegistration, ServiceError, ServiceRecord, ServiceResult,
    ServiceState,
};
use skein_core::impls::{InMemoryServiceStore, LoggingNotificationSink};
use skein_core::ports::{Clock, IdGenerator, ServiceStore, SystemClock, UlidGenerator};

#[derive(Debug, Deserialize)]
struct GreetArgs {
    name: String,
}

/// dictionaryArgs の `name` に挨拶する
struct Greet;

#[async_trait]
impl ServiceProcessor for Greet {
    fn name(&self) -> &str {
        "greet"
    }

    async fn prepare(&self, record: ServiceRecord) -> ServiceResult<ServiceRecord> {
        parse_args(&record)?;
        Ok(record)
    }

    fn process(&self, record: &ServiceRecord, _deps: ResolvedDependencies) -> Computation<Value> {
        let args = parse_args(record);
        Computation::spawn(async move {
            let args = args?;
            // 外部プロセスの代わり
            sleep(Duration::from_millis(100)).await;
            Ok(json!({ "stdout": format!("Hello, {}!", args.name) }))
        })
    }
}

fn parse_args(record: &ServiceRecord) -> ServiceResult<GreetArgs> {
    serde_json::from_value(Value::Object(record.dictionary_args.clone()))
        .map_err(|e| ServiceError::validation(format!("greet args: {e}")))
}

/// args の名前ごとに greet の子サービスを作り、結果をまとめる
struct GreetAll;

#[async_trait]
impl ServiceProcessor for GreetAll {
    fn name(&self) -> &str {
        "greet-all"
    }

    fn submit_dependencies(&self, record: &ServiceRecord) -> Computation<DependencyResult> {
        let children = record
            .args
            .iter()
            .map(|name| {
                ServiceRecord::new("greet")
                    .with_dictionary_arg("name", name.clone())
                    .with_resource("slots", "1")
            })
            .collect();
        Computation::completed(DependencyResult::of(children))
    }

    fn process(&self, _record: &ServiceRecord, deps: ResolvedDependencies) -> Computation<Value> {
        let lines: Vec<Value> = deps
            .records
            .iter()
            .filter_map(|r| r.serializable_result.as_ref())
            .filter_map(|v| v.get("stdout").cloned())
            .collect();
        Computation::completed(json!({ "greetings": lines }))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("skein=debug")),
        )
        .init();

    // (A) store と engine を用意
    let config = EngineConfig::from_env()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(clock.clone()));
    let store = Arc::new(InMemoryServiceStore::new(clock.clone(), ids.clone()));

    let engine = EngineBuilder::new(store.clone())
        .with_clock(clock)
        .with_id_generator(ids)
        .with_notification_sink(Arc::new(LoggingNotificationSink))
        .with_config(config.clone())
        .register(Arc::new(Greet))?
        .register(Arc::new(GreetAll))?
        .expect_processors(&[("greet", ""), ("greet-all", "")])
        .build()?;
    let engine = Arc::new(engine);

    // (B) worker を 2 本起動
    let group = WorkerGroup::spawn(2, engine.clone(), config.worker.clone());

    // (C) サービス投入
    let submitted = engine
        .submit(
            ServiceRecord::new("greet-all")
                .with_description("greet everyone")
                .with_arg("skein")
                .with_arg("tokio")
                .with_arg("serde")
                .with_notification(
                    "finished",
                    NotificationRegistration::on_stage("finished", LifecycleStage::Successful),
                ),
        )
        .await?;
    let id = submitted.require_id()?;
    info!(service_id = %id, "submitted");

    // (D) 完了をポーリングで待つ（Ctrl-C でも抜ける）
    let finished = tokio::select! {
        record = async {
            loop {
                match store.find_by_id(id).await {
                    Ok(Some(record)) if record.state.is_finished() => break Some(record),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "status check failed"),
                }
                sleep(Duration::from_millis(50)).await;
            }
        } => record,
        _ = tokio::signal::ctrl_c() => None,
    };

    if let Some(record) = finished {
        info!(
            state = %record.state,
            result = ?record.serializable_result,
            events = record.events.len(),
            "final status"
        );
        if record.state == ServiceState::Successful {
            engine.retire(id).await?;
        }
    }

    // (E) graceful shutdown
    group.shutdown_and_join().await;
    Ok(())
}
