//! 流水线端到端测试
//!
//! 使用进程内的假门户会话、假识别器和内存数据库驱动完整的 `QueryPipeline`

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use consulta_placas::error::{AppError, AppResult, CaptchaError, ErrorKind, PortalError};
use consulta_placas::models::{
    PapeletasStatus, RawResult, SearchMode, SessionFormState, Source, UpsertAction, SCPPP_FORM,
};
use consulta_placas::services::{
    CaptchaAdapter, CaptchaChallenge, MarkupExtraction, Recognizer, RecordStore,
    VisionLabelExtraction,
};
use consulta_placas::workflow::{
    session_left_open, Challenge, PipelineSettings, PipelineStage, PortalConnector, PortalSession,
    QueryPipeline, QueryRequest,
};

const LANDING_OK: &str = r#"
    <form>
        <input type="hidden" name="__VIEWSTATE" value="vs" />
        <input type="hidden" name="__EVENTVALIDATION" value="ev" />
    </form>
"#;

const LANDING_CHANGED: &str = r#"<form><input type="hidden" name="__EVENTVALIDATION" value="ev" /></form>"#;

const VEHICLE_SHEET: &str = "Nº PLACA: ABC123\nMARCA: TOYOTA\nMODELO: YARIS\nESTADO: EN CIRCULACION";

const DRIVER_RESULT: &str = r#"
    <span id="lblAdministrado">PEREZ GOMEZ JUAN</span>
    <span id="lblDni">45678912</span>
    <span id="lblLicencia">Q45678912</span>
    <span id="lblClaseCategoria">A I</span>
    <span id="lblVigencia">12/05/2027</span>
    <span id="lblEstadoLicencia">VIGENTE</span>
    <table id="gvPapeletas">
        <tr><th>Fecha</th><th>Infracción</th></tr>
        <tr><td>01/02/2024</td><td>G58</td></tr>
        <tr><td>15/03/2024</td><td>M20</td></tr>
    </table>
"#;

/// 假门户的脚本
#[derive(Clone)]
struct Script {
    landing: &'static str,
    challenge: Challenge,
    /// 交互式验证在第几次轮询时完成（None 表示永远不完成）
    completes_after: Option<usize>,
    /// 在该阶段挂起
    hang_at: Option<PipelineStage>,
    reject_answer: bool,
    close_fails: bool,
    result: RawResult,
}

impl Script {
    fn vehicle() -> Self {
        Self {
            landing: LANDING_OK,
            challenge: image_challenge(),
            completes_after: Some(0),
            hang_at: None,
            reject_answer: false,
            close_fails: false,
            result: RawResult::Screenshot(vec![0x89, b'P', b'N', b'G']),
        }
    }

    fn driver() -> Self {
        Self {
            result: RawResult::Html(DRIVER_RESULT.to_string()),
            ..Self::vehicle()
        }
    }
}

fn image_challenge() -> Challenge {
    Challenge::Image(CaptchaChallenge {
        image: vec![1, 2, 3],
        content_type: Some("image/png".to_string()),
        issued_by: "fake://captcha".to_string(),
    })
}

/// 会话观测：测试结束后检查
#[derive(Default)]
struct SessionLog {
    connects: AtomicUsize,
    closed: AtomicBool,
    captcha_fetches: AtomicUsize,
    polls: AtomicUsize,
    answers: Mutex<Vec<Option<String>>>,
}

struct FakeSession {
    script: Script,
    log: Arc<SessionLog>,
    state: Option<SessionFormState>,
}

impl FakeSession {
    async fn maybe_hang(&self, stage: PipelineStage) {
        if self.script.hang_at == Some(stage) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
    }
}

#[async_trait]
impl PortalSession for FakeSession {
    async fn load_landing(&mut self) -> AppResult<()> {
        self.maybe_hang(PipelineStage::LandingLoaded).await;
        self.state = Some(SessionFormState::initialize(self.script.landing, &SCPPP_FORM)?);
        Ok(())
    }

    async fn select_mode(&mut self, _request: &QueryRequest) -> AppResult<()> {
        self.maybe_hang(PipelineStage::ModeSelected).await;
        Ok(())
    }

    async fn fetch_challenge(&mut self) -> AppResult<Challenge> {
        self.maybe_hang(PipelineStage::CaptchaFetched).await;
        self.log.captcha_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.script.challenge.clone())
    }

    async fn challenge_completed(&mut self) -> AppResult<bool> {
        let polls = self.log.polls.fetch_add(1, Ordering::SeqCst);
        Ok(self.script.completes_after.is_some_and(|n| polls >= n))
    }

    async fn submit(&mut self, _request: &QueryRequest, answer: Option<&str>) -> AppResult<RawResult> {
        self.maybe_hang(PipelineStage::Submitted).await;
        self.log
            .answers
            .lock()
            .unwrap()
            .push(answer.map(str::to_string));
        if self.script.reject_answer {
            return Err(PortalError::ChallengeRejected {
                message: "El código captcha es incorrecto".to_string(),
            }
            .into());
        }
        Ok(self.script.result.clone())
    }

    async fn close(&mut self) -> AppResult<()> {
        self.log.closed.store(true, Ordering::SeqCst);
        if self.script.close_fails {
            return Err(AppError::Other("浏览器进程没有响应".to_string()));
        }
        Ok(())
    }
}

struct FakeConnector {
    script: Script,
    log: Arc<SessionLog>,
}

impl FakeConnector {
    fn new(script: Script) -> Self {
        Self {
            script,
            log: Arc::new(SessionLog::default()),
        }
    }
}

#[async_trait]
impl PortalConnector for FakeConnector {
    type Session = FakeSession;

    async fn connect(&self) -> AppResult<FakeSession> {
        self.log.connects.fetch_add(1, Ordering::SeqCst);
        Ok(FakeSession {
            script: self.script.clone(),
            log: Arc::clone(&self.log),
            state: None,
        })
    }
}

/// 依次返回预设输出的识别器，用完后返回空字符串
struct ScriptedRecognizer {
    outputs: Mutex<VecDeque<String>>,
}

impl ScriptedRecognizer {
    fn new(outputs: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            outputs: Mutex::new(outputs.iter().map(|s| s.to_string()).collect()),
        })
    }
}

#[async_trait]
impl Recognizer for ScriptedRecognizer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn recognize(&self, _image: &[u8]) -> AppResult<String> {
        Ok(self.outputs.lock().unwrap().pop_front().unwrap_or_default())
    }
}

/// 识别器本身不可用（例如找不到 tesseract）
struct BrokenRecognizer;

#[async_trait]
impl Recognizer for BrokenRecognizer {
    fn name(&self) -> &str {
        "broken"
    }

    async fn recognize(&self, _image: &[u8]) -> AppResult<String> {
        Err(CaptchaError::RecognizerFailed {
            recognizer: "broken".to_string(),
            message: "No such file or directory".to_string(),
        }
        .into())
    }
}

/// 永远不返回的识别器（模拟卡住的视觉模型）
struct StalledReader;

#[async_trait]
impl Recognizer for StalledReader {
    fn name(&self) -> &str {
        "stalled"
    }

    async fn recognize(&self, _image: &[u8]) -> AppResult<String> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(String::new())
    }
}

/// 永远返回同一段文本（模拟视觉模型读取整页截图）
struct SheetReader(&'static str);

#[async_trait]
impl Recognizer for SheetReader {
    fn name(&self) -> &str {
        "sheet"
    }

    async fn recognize(&self, _image: &[u8]) -> AppResult<String> {
        Ok(self.0.to_string())
    }
}

fn settings() -> PipelineSettings {
    PipelineSettings {
        captcha_retries: 1,
        stage_timeout: Duration::from_millis(300),
        submit_timeout: Duration::from_millis(300),
        manual_challenge_timeout: Duration::from_millis(100),
        manual_poll_interval: Duration::from_millis(10),
    }
}

fn pipeline(captcha_outputs: &[&str]) -> (QueryPipeline, Arc<RecordStore>) {
    let store = Arc::new(RecordStore::in_memory().unwrap());
    let pipeline = QueryPipeline::new(
        CaptchaAdapter::new(ScriptedRecognizer::new(captcha_outputs)),
        Arc::clone(&store),
        settings(),
    );
    (pipeline, store)
}

fn vehicle_extraction() -> VisionLabelExtraction {
    VisionLabelExtraction::vehicle(Arc::new(SheetReader(VEHICLE_SHEET)))
}

#[tokio::test]
async fn test_missing_token_fails_at_landing_without_persisting() {
    let _ = tracing_subscriber::fmt::try_init();

    let (pipeline, store) = pipeline(&["AB3C"]);
    let connector = FakeConnector::new(Script {
        landing: LANDING_CHANGED,
        ..Script::vehicle()
    });

    let failure = pipeline
        .run(&connector, &vehicle_extraction(), &QueryRequest::vehicle("ABC123"))
        .await
        .unwrap_err();

    assert_eq!(failure.stage, PipelineStage::LandingLoaded);
    assert_eq!(failure.kind(), ErrorKind::MissingRequiredToken);
    assert_eq!(store.count_live(Source::Vehiculo).unwrap(), 0);
    assert!(store.history(Source::Vehiculo, "ABC123").unwrap().is_empty());
    assert!(connector.log.closed.load(Ordering::SeqCst));
    assert_eq!(connector.log.captcha_fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_successful_vehicle_run_creates_live_entity() {
    let (pipeline, store) = pipeline(&[" ab-3C! "]);
    let connector = FakeConnector::new(Script::vehicle());

    let success = pipeline
        .run(&connector, &vehicle_extraction(), &QueryRequest::vehicle("abc123"))
        .await
        .unwrap();

    assert_eq!(success.natural_key, "ABC123");
    assert_eq!(success.persistence.action, UpsertAction::Created);
    assert_eq!(success.persistence.query_count, 1);
    assert_eq!(success.field_count, 4);
    assert!(!success.incomplete);
    assert_eq!(
        connector.log.answers.lock().unwrap().as_slice(),
        &[Some("AB3C".to_string())]
    );

    let entity = store.get_live(Source::Vehiculo, "ABC123").unwrap().unwrap();
    assert_eq!(entity.query_count, 1);
    assert!(entity.deleted_at.is_none());
    assert_eq!(entity.fields.get("MARCA"), "TOYOTA");
    assert_eq!(store.count_live(Source::Vehiculo).unwrap(), 1);
    assert!(connector.log.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_second_run_updates_same_entity() {
    let (pipeline, store) = pipeline(&["AB3C", "XY9Z"]);
    let connector = FakeConnector::new(Script::vehicle());
    let request = QueryRequest::vehicle("ABC123");

    pipeline.run(&connector, &vehicle_extraction(), &request).await.unwrap();
    let second = pipeline.run(&connector, &vehicle_extraction(), &request).await.unwrap();

    assert_eq!(second.persistence.action, UpsertAction::Updated);
    assert_eq!(second.persistence.query_count, 2);
    assert_eq!(store.count_live(Source::Vehiculo).unwrap(), 1);
}

#[tokio::test]
async fn test_unresolved_captcha_is_refetched_once() {
    let (pipeline, _store) = pipeline(&["  ?? ", "K7PQ"]);
    let connector = FakeConnector::new(Script::vehicle());

    let success = pipeline
        .run(&connector, &vehicle_extraction(), &QueryRequest::vehicle("ABC123"))
        .await
        .unwrap();

    assert_eq!(success.persistence.action, UpsertAction::Created);
    assert_eq!(connector.log.captcha_fetches.load(Ordering::SeqCst), 2);
    assert_eq!(
        connector.log.answers.lock().unwrap().as_slice(),
        &[Some("K7PQ".to_string())]
    );
}

#[tokio::test]
async fn test_captcha_fails_after_retry_budget() {
    let (pipeline, store) = pipeline(&["", "---"]);
    let connector = FakeConnector::new(Script::vehicle());

    let failure = pipeline
        .run(&connector, &vehicle_extraction(), &QueryRequest::vehicle("ABC123"))
        .await
        .unwrap_err();

    assert_eq!(failure.stage, PipelineStage::CaptchaSolved);
    assert_eq!(failure.kind(), ErrorKind::CaptchaUnresolved);
    assert_eq!(connector.log.captcha_fetches.load(Ordering::SeqCst), 2);
    assert!(connector.log.answers.lock().unwrap().is_empty());
    assert_eq!(store.count_live(Source::Vehiculo).unwrap(), 0);
    assert!(connector.log.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_interactive_challenge_waits_for_completion() {
    let (pipeline, _store) = pipeline(&[]);
    let connector = FakeConnector::new(Script {
        challenge: Challenge::Interactive {
            selector: "div.cf-turnstile".to_string(),
        },
        completes_after: Some(3),
        ..Script::vehicle()
    });

    let success = pipeline
        .run(&connector, &vehicle_extraction(), &QueryRequest::vehicle("ABC123"))
        .await
        .unwrap();

    assert_eq!(success.persistence.query_count, 1);
    assert!(connector.log.polls.load(Ordering::SeqCst) >= 4);
    assert_eq!(connector.log.answers.lock().unwrap().as_slice(), &[None]);
}

#[tokio::test]
async fn test_interactive_challenge_times_out() {
    let (pipeline, store) = pipeline(&[]);
    let connector = FakeConnector::new(Script {
        challenge: Challenge::Interactive {
            selector: "div.cf-turnstile".to_string(),
        },
        completes_after: None,
        ..Script::vehicle()
    });

    let failure = pipeline
        .run(&connector, &vehicle_extraction(), &QueryRequest::vehicle("ABC123"))
        .await
        .unwrap_err();

    assert_eq!(failure.stage, PipelineStage::CaptchaSolved);
    assert!(matches!(
        failure.error,
        consulta_placas::AppError::Captcha(CaptchaError::ManualTimeout { .. })
    ));
    assert_eq!(store.count_live(Source::Vehiculo).unwrap(), 0);
    assert!(connector.log.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_hanging_stage_becomes_timeout_failure() {
    let (pipeline, _store) = pipeline(&["AB3C"]);
    let connector = FakeConnector::new(Script {
        hang_at: Some(PipelineStage::ModeSelected),
        ..Script::vehicle()
    });

    let failure = pipeline
        .run(&connector, &vehicle_extraction(), &QueryRequest::vehicle("ABC123"))
        .await
        .unwrap_err();

    assert_eq!(failure.stage, PipelineStage::ModeSelected);
    assert_eq!(failure.kind(), ErrorKind::PortalUnavailable);
    assert!(failure.to_string().contains("MODE_SELECTED"));
    assert!(failure.close_error.is_none());
    assert!(connector.log.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_rejected_answer_fails_at_submit() {
    let (pipeline, store) = pipeline(&["AB3C"]);
    let connector = FakeConnector::new(Script {
        reject_answer: true,
        ..Script::driver()
    });

    let failure = pipeline
        .run(
            &connector,
            &MarkupExtraction::driver(),
            &QueryRequest::driver("Q45678912", SearchMode::Licencia),
        )
        .await
        .unwrap_err();

    assert_eq!(failure.stage, PipelineStage::Submitted);
    assert_eq!(failure.kind(), ErrorKind::ChallengeRejected);
    assert_eq!(store.count_live(Source::Conductor).unwrap(), 0);
}

#[tokio::test]
async fn test_driver_run_persists_papeletas() {
    let (pipeline, store) = pipeline(&["AB3C"]);
    let connector = FakeConnector::new(Script::driver());

    let success = pipeline
        .run(
            &connector,
            &MarkupExtraction::driver(),
            &QueryRequest::driver(" Q45678912 ", SearchMode::Licencia),
        )
        .await
        .unwrap();

    let papeletas = success.papeletas.unwrap();
    assert_eq!(papeletas.status, PapeletasStatus::ConPapeletas);
    assert_eq!(papeletas.count, 2);

    let entity = store.get_live(Source::Conductor, "Q45678912").unwrap().unwrap();
    assert_eq!(entity.fields.get("NOMBRE_COMPLETO"), "PEREZ GOMEZ JUAN");
    assert_eq!(entity.fields.get("PAPELETAS_CANTIDAD"), "2");
}

#[tokio::test]
async fn test_empty_result_is_success_with_incomplete_flag() {
    let (pipeline, store) = pipeline(&["AB3C"]);
    let connector = FakeConnector::new(Script::vehicle());
    let extraction = VisionLabelExtraction::vehicle(Arc::new(SheetReader("Sin resultados")));

    let success = pipeline
        .run(&connector, &extraction, &QueryRequest::vehicle("ZZZ999"))
        .await
        .unwrap();

    assert_eq!(success.field_count, 0);
    assert!(success.incomplete);
    assert_eq!(store.count_live(Source::Vehiculo).unwrap(), 1);
}

#[tokio::test]
async fn test_blank_plate_is_rejected_before_connecting() {
    let (pipeline, store) = pipeline(&["AB3C"]);
    let connector = FakeConnector::new(Script::vehicle());

    let failure = pipeline
        .run(&connector, &vehicle_extraction(), &QueryRequest::vehicle("   "))
        .await
        .unwrap_err();

    assert_eq!(failure.stage, PipelineStage::Init);
    assert_eq!(failure.kind(), ErrorKind::InvalidInput);
    assert_eq!(connector.log.connects.load(Ordering::SeqCst), 0);
    assert_eq!(store.count_live(Source::Vehiculo).unwrap(), 0);
    assert!(store.history(Source::Vehiculo, "").unwrap().is_empty());
}

#[tokio::test]
async fn test_recognizer_failure_is_not_retried() {
    let store = Arc::new(RecordStore::in_memory().unwrap());
    let pipeline = QueryPipeline::new(
        CaptchaAdapter::new(Arc::new(BrokenRecognizer)),
        Arc::clone(&store),
        settings(),
    );
    let connector = FakeConnector::new(Script::vehicle());

    let failure = pipeline
        .run(&connector, &vehicle_extraction(), &QueryRequest::vehicle("ABC123"))
        .await
        .unwrap_err();

    assert_eq!(failure.stage, PipelineStage::CaptchaSolved);
    assert_eq!(failure.kind(), ErrorKind::RecognizerFailed);
    assert_eq!(connector.log.captcha_fetches.load(Ordering::SeqCst), 1);
    assert!(connector.log.answers.lock().unwrap().is_empty());
    assert!(connector.log.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_hanging_extraction_is_extraction_failure() {
    let (pipeline, store) = pipeline(&["AB3C"]);
    let connector = FakeConnector::new(Script::vehicle());
    let extraction = VisionLabelExtraction::vehicle(Arc::new(StalledReader));

    let failure = pipeline
        .run(&connector, &extraction, &QueryRequest::vehicle("ABC123"))
        .await
        .unwrap_err();

    assert_eq!(failure.stage, PipelineStage::Parsed);
    assert_eq!(failure.kind(), ErrorKind::ExtractionFailed);
    assert_eq!(store.count_live(Source::Vehiculo).unwrap(), 0);
}

#[tokio::test]
async fn test_persist_waits_for_locked_database() {
    let _ = tracing_subscriber::fmt::try_init();

    let path = std::env::temp_dir().join(format!("consultas_lock_{}.db", std::process::id()));
    let _ = std::fs::remove_file(&path);
    let store = Arc::new(RecordStore::open(&path).unwrap());
    let pipeline = QueryPipeline::new(
        CaptchaAdapter::new(ScriptedRecognizer::new(&["AB3C"])),
        Arc::clone(&store),
        settings(),
    );

    // 另一个连接持有写锁，时间超过单步超时
    let writer = rusqlite::Connection::open(&path).unwrap();
    writer.execute_batch("BEGIN IMMEDIATE").unwrap();
    let holder = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_secs(1));
        writer.execute_batch("COMMIT").unwrap();
    });

    let connector = FakeConnector::new(Script::vehicle());
    let outcome = pipeline
        .run(&connector, &vehicle_extraction(), &QueryRequest::vehicle("ABC123"))
        .await;
    holder.join().unwrap();

    // 返回结果与数据库状态一致
    let success = outcome.unwrap();
    assert_eq!(success.persistence.action, UpsertAction::Created);
    let entity = store.get_live(Source::Vehiculo, "ABC123").unwrap().unwrap();
    assert_eq!(entity.query_count, success.persistence.query_count);
    assert_eq!(entity.query_count, 1);

    drop(store);
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_close_failure_is_reported_on_success() {
    let (pipeline, store) = pipeline(&["AB3C"]);
    let connector = FakeConnector::new(Script {
        close_fails: true,
        ..Script::vehicle()
    });

    let outcome = pipeline
        .run(&connector, &vehicle_extraction(), &QueryRequest::vehicle("ABC123"))
        .await;

    assert!(session_left_open(&outcome));
    let success = outcome.unwrap();
    assert!(success.close_error.unwrap().contains("浏览器进程没有响应"));
    assert_eq!(store.count_live(Source::Vehiculo).unwrap(), 1);
}

#[tokio::test]
async fn test_close_failure_is_reported_on_failure() {
    let (pipeline, _store) = pipeline(&["AB3C"]);
    let connector = FakeConnector::new(Script {
        close_fails: true,
        reject_answer: true,
        ..Script::vehicle()
    });

    let failure = pipeline
        .run(&connector, &vehicle_extraction(), &QueryRequest::vehicle("ABC123"))
        .await
        .unwrap_err();

    assert_eq!(failure.kind(), ErrorKind::ChallengeRejected);
    assert!(failure.report().close_error.is_some());
}
