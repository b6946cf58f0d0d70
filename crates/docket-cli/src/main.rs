use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

use docket_core::analysis::handlers::{
    DetectJurisdictionHandler, JurisdictionAnalysisHandler, ProcessDocumentHandler,
};
use docket_core::analysis::{
    Document, DocumentRepository, InMemoryDocuments, KeywordDetector, PlainTextExtractor,
    StaticAnalyzer,
};
use docket_core::app::App;
use docket_core::monitor::StatusView;
use docket_core::queue::{PurgeScope, QueueName};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // (A) リポジトリとコラボレータを用意（デモ用はインメモリ実装）
    let repo = Arc::new(InMemoryDocuments::new());
    repo.insert(Document::uploaded(
        "doc-1",
        "master-services-agreement.txt",
        b"Consideration of ten lakh rupees. Disputes lie before the High Court of Delhi."
            .to_vec(),
    ))
    .await;
    let repository = repo.clone() as Arc<dyn DocumentRepository>;

    // (B) App を構築（handler 登録 + fail-fast 検証）
    let app = App::builder()
        .register(ProcessDocumentHandler::new(
            Arc::clone(&repository),
            Arc::new(PlainTextExtractor),
        ))?
        .register(DetectJurisdictionHandler::new(
            Arc::clone(&repository),
            Arc::new(KeywordDetector),
        ))?
        .register(JurisdictionAnalysisHandler::new(
            "analyze_india",
            "INDIA",
            Arc::clone(&repository),
            StaticAnalyzer::india(),
        ))?
        .register(JurisdictionAnalysisHandler::new(
            "analyze_us",
            "US",
            Arc::clone(&repository),
            StaticAnalyzer::us(),
        ))?
        .register(JurisdictionAnalysisHandler::new(
            "analyze_cross_border",
            "CROSS_BORDER",
            Arc::clone(&repository),
            StaticAnalyzer::cross_border(),
        ))?
        .expect_tasks(&[
            "process_document",
            "detect_jurisdiction",
            "analyze_india",
            "analyze_us",
            "analyze_cross_border",
        ])
        .build()
        .await?;

    // (C) worker を起動（デフォルト 4 スロット）
    let workers = app.spawn_workers().await;

    // (D) 単発タスク: ドキュメント処理を投入してポーリングで完了を待つ
    let task_id = app
        .submit(
            "process_document",
            serde_json::json!({ "document_id": "doc-1" }),
        )
        .await?;
    println!("submitted process_document: {task_id}");

    loop {
        let payload = app.monitor().status(task_id).await;
        match payload.state {
            StatusView::Success => {
                println!("processed: {:?}", payload.result);
                break;
            }
            StatusView::Failure => {
                println!("processing failed: {:?}", payload.error);
                break;
            }
            state => {
                let snap = app.tracker().get(task_id).await;
                println!("state={state:?} progress={}% {}", snap.percentage, snap.message);
            }
        }
        sleep(Duration::from_millis(100)).await;
    }

    // (E) 多段パイプライン: 検出 → 管轄別分析
    let pipeline_id = app.comprehensive_analysis("doc-1").await?;
    println!("pipeline started: {pipeline_id}");
    let combined = app
        .composer()
        .wait(pipeline_id, Duration::from_secs(30))
        .await?;
    println!(
        "jurisdiction={} findings={}",
        combined["detection"]["jurisdiction"], combined["analysis"]
    );

    // (F) 管理系サーフェス: active / scheduled / queue_length / purge
    println!("active: {:?}", app.monitor().active().await);
    println!("scheduled: {:?}", app.monitor().scheduled().await);
    println!(
        "jurisdiction_analysis length: {}",
        app.monitor()
            .queue_length(&QueueName::jurisdiction_analysis())
            .await
    );
    let dropped = app.monitor().purge(PurgeScope::All).await;
    println!("purged {dropped} queued messages");

    workers.shutdown_and_join().await;
    Ok(())
}
