//! Forwarding of stored captures to a Supabase REST table
//!
//! Pending rows go out as one JSON array. If the batch is rejected each row
//! is retried on its own so a single bad row cannot block the queue. Rows
//! are deleted locally only after a 2xx answer.

use parking_lot::Mutex;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::storage::{Storage, StoredCapture};

const CLIENT_INFO: &str = concat!("facecam/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Serialize)]
struct CapturePayload<'a> {
    device_id: &'a str,
    date: &'a str,
    time: &'a str,
    image_base64: &'a str,
}

/// How a sync pass delivered its rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncMode {
    /// Nothing was pending
    #[default]
    Idle,
    Batch,
    Individual,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub fetched: usize,
    pub sent: usize,
    pub mode: SyncMode,
}

/// Client for the captures table.
pub struct SupabaseClient {
    http: reqwest::Client,
    endpoint: String,
    anon_key: String,
    device_id: String,
    batch_timeout: Duration,
    single_timeout: Duration,
}

impl SupabaseClient {
    /// Build a client, or `None` when the URL or anon key is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &SyncConfig) -> Result<Option<Self>> {
        if !config.is_configured() {
            return Ok(None);
        }
        let (Some(url), Some(anon_key)) = (config.url.as_deref(), config.anon_key.as_deref()) else {
            return Ok(None);
        };

        let http = reqwest::Client::builder().user_agent(CLIENT_INFO).build()?;
        Ok(Some(Self {
            http,
            endpoint: format!("{}/rest/v1/{}", url.trim().trim_end_matches('/'), config.table),
            anon_key: anon_key.trim().to_string(),
            device_id: config.device_id(),
            batch_timeout: Duration::from_secs(config.batch_timeout_secs),
            single_timeout: Duration::from_secs(config.single_timeout_secs),
        }))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn payload<'a>(&'a self, row: &'a StoredCapture) -> CapturePayload<'a> {
        CapturePayload {
            device_id: &self.device_id,
            date: &row.date,
            time: &row.time,
            image_base64: &row.image_base64,
        }
    }

    async fn post<T: Serialize + ?Sized>(&self, body: &T, timeout: Duration) -> Result<()> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("apikey", &self.anon_key)
            .bearer_auth(&self.anon_key)
            .header(CONTENT_TYPE, "application/json")
            .header("Prefer", "return=minimal")
            .header("X-Client-Info", CLIENT_INFO)
            .timeout(timeout)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::Remote {
            status: status.as_u16(),
            body,
        })
    }

    /// POST every row as one JSON array.
    pub async fn post_batch(&self, rows: &[StoredCapture]) -> Result<()> {
        let payload: Vec<CapturePayload<'_>> = rows.iter().map(|row| self.payload(row)).collect();
        self.post(&payload, self.batch_timeout).await
    }

    /// POST a single row as a JSON object.
    pub async fn post_one(&self, row: &StoredCapture) -> Result<()> {
        self.post(&self.payload(row), self.single_timeout).await
    }
}

/// Run a storage call on the blocking pool. The face worker may hold the
/// lock during an insert, so it is never taken on a runtime thread.
pub async fn with_storage<T, F>(storage: &Arc<Mutex<Storage>>, f: F) -> Result<T>
where
    F: FnOnce(&Storage) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let storage = storage.clone();
    tokio::task::spawn_blocking(move || f(&storage.lock())).await?
}

/// Send up to `max_batch` of the oldest pending rows and delete the ones
/// the backend accepted.
///
/// # Errors
///
/// Returns an error only for local database failures; remote failures are
/// logged and leave the rows queued.
pub async fn sync_pending(
    client: &SupabaseClient,
    storage: &Arc<Mutex<Storage>>,
    max_batch: usize,
) -> Result<SyncReport> {
    let rows = with_storage(storage, move |s| s.fetch_pending(max_batch)).await?;
    if rows.is_empty() {
        return Ok(SyncReport::default());
    }
    let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();

    match client.post_batch(&rows).await {
        Ok(()) => {
            with_storage(storage, move |s| s.delete(&ids)).await?;
            info!("Synced {} capture(s) and removed them locally", rows.len());
            return Ok(SyncReport {
                fetched: rows.len(),
                sent: rows.len(),
                mode: SyncMode::Batch,
            });
        }
        Err(e) => warn!("Batch sync failed ({}), sending rows individually", e),
    }

    let mut sent = 0;
    for row in &rows {
        match client.post_one(row).await {
            Ok(()) => {
                let id = row.id;
                with_storage(storage, move |s| s.delete(&[id])).await?;
                sent += 1;
            }
            Err(Error::Remote { status, body }) => {
                warn!("Failed to send capture {}: {} - {}", row.id, status, body);
            }
            Err(e) => warn!("Failed to send capture {}: {}", row.id, e),
        }
    }

    if sent > 0 {
        info!("Synced {}/{} capture(s) individually", sent, rows.len());
    } else {
        warn!("Could not sync any of {} pending capture(s)", rows.len());
    }
    Ok(SyncReport {
        fetched: rows.len(),
        sent,
        mode: SyncMode::Individual,
    })
}

/// Sync every `every` until `shutdown` flips.
pub async fn run_periodic(
    client: Arc<SupabaseClient>,
    storage: Arc<Mutex<Storage>>,
    every: Duration,
    batch_size: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Sync to {} every {:.1}s", client.endpoint(), every.as_secs_f64());
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = sync_pending(&client, &storage, batch_size).await {
                    warn!("Sync pass failed: {}", e);
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("Periodic sync stopped");
}

/// Last pass on shutdown; errors are only logged.
pub async fn final_flush(client: &SupabaseClient, storage: &Arc<Mutex<Storage>>, batch_size: usize) {
    match sync_pending(client, storage, batch_size).await {
        Ok(report) if report.fetched > 0 => {
            info!("Final sync sent {}/{} capture(s)", report.sent, report.fetched);
        }
        Ok(_) => {}
        Err(e) => debug!("Final sync skipped: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, TimeZone};
    use httpmock::prelude::HttpMockRequest;
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn body_text(req: &HttpMockRequest) -> String {
        req.body
            .as_ref()
            .map(|b| String::from_utf8_lossy(b).to_string())
            .unwrap_or_default()
    }

    fn is_array(req: &HttpMockRequest) -> bool {
        body_text(req).trim_start().starts_with('[')
    }

    fn is_object(req: &HttpMockRequest) -> bool {
        body_text(req).trim_start().starts_with('{')
    }

    fn is_good_object(req: &HttpMockRequest) -> bool {
        is_object(req) && body_text(req).contains("good")
    }

    fn is_bad_object(req: &HttpMockRequest) -> bool {
        is_object(req) && body_text(req).contains("bad")
    }

    fn config(url: &str) -> SyncConfig {
        SyncConfig {
            url: Some(format!("{url}/")),
            anon_key: Some("anon-key".to_string()),
            device_id: Some("pi-test".to_string()),
            ..SyncConfig::default()
        }
    }

    fn storage_with(images: &[&str]) -> Arc<Mutex<Storage>> {
        let storage = Storage::open_in_memory().unwrap();
        let at = Local.with_ymd_and_hms(2024, 5, 17, 9, 30, 0).unwrap();
        for image in images {
            storage.insert(image, at).unwrap();
        }
        Arc::new(Mutex::new(storage))
    }

    #[test]
    fn unconfigured_client_is_none() {
        let client = SupabaseClient::new(&SyncConfig::default()).unwrap();
        assert!(client.is_none());
    }

    #[test]
    fn endpoint_trims_trailing_slash() {
        let client = SupabaseClient::new(&config("https://example.supabase.co"))
            .unwrap()
            .unwrap();
        assert_eq!(client.endpoint(), "https://example.supabase.co/rest/v1/captures");
        assert_eq!(client.device_id(), "pi-test");
    }

    #[tokio::test]
    async fn batch_success_deletes_rows() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/rest/v1/captures")
                .header("apikey", "anon-key")
                .header("authorization", "Bearer anon-key")
                .header("prefer", "return=minimal")
                .body_contains("\"device_id\":\"pi-test\"")
                .body_contains("\"date\":\"2024-05-17\"")
                .matches(is_array);
            then.status(201);
        });

        let client = SupabaseClient::new(&config(&server.base_url())).unwrap().unwrap();
        let storage = storage_with(&["aaa", "bbb", "ccc"]);

        let report = sync_pending(&client, &storage, 50).await.unwrap();
        mock.assert();
        assert_eq!(
            report,
            SyncReport {
                fetched: 3,
                sent: 3,
                mode: SyncMode::Batch
            }
        );
        assert_eq!(storage.lock().count().unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_batch_falls_back_to_single_rows() {
        let server = MockServer::start_async().await;
        let batch = server.mock(|when, then| {
            when.method(POST).path("/rest/v1/captures").matches(is_array);
            then.status(500).body("batch rejected");
        });
        let good = server.mock(|when, then| {
            when.method(POST).path("/rest/v1/captures").matches(is_good_object);
            then.status(201);
        });
        let bad = server.mock(|when, then| {
            when.method(POST).path("/rest/v1/captures").matches(is_bad_object);
            then.status(400).body("invalid image");
        });

        let client = SupabaseClient::new(&config(&server.base_url())).unwrap().unwrap();
        let storage = storage_with(&["good-1", "bad-1", "good-2"]);

        let report = sync_pending(&client, &storage, 50).await.unwrap();
        batch.assert_hits(1);
        good.assert_hits(2);
        bad.assert_hits(1);
        assert_eq!(report.fetched, 3);
        assert_eq!(report.sent, 2);
        assert_eq!(report.mode, SyncMode::Individual);

        let left = storage.lock().fetch_pending(10).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].image_base64, "bad-1");
    }

    #[tokio::test]
    async fn batch_size_limits_rows() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST).path("/rest/v1/captures").matches(is_array);
            then.status(201);
        });

        let client = SupabaseClient::new(&config(&server.base_url())).unwrap().unwrap();
        let storage = storage_with(&["one", "two", "three"]);

        let report = sync_pending(&client, &storage, 2).await.unwrap();
        mock.assert();
        assert_eq!(report.sent, 2);

        let left = storage.lock().fetch_pending(10).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].image_base64, "three");
    }

    #[tokio::test]
    async fn nothing_pending_sends_nothing() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST);
            then.status(201);
        });

        let client = SupabaseClient::new(&config(&server.base_url())).unwrap().unwrap();
        let storage = storage_with(&[]);

        let report = sync_pending(&client, &storage, 50).await.unwrap();
        mock.assert_hits(0);
        assert_eq!(report, SyncReport::default());
    }

    #[tokio::test]
    async fn periodic_sync_stops_on_shutdown() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST).path("/rest/v1/captures");
            then.status(201);
        });

        let client = Arc::new(SupabaseClient::new(&config(&server.base_url())).unwrap().unwrap());
        let storage = storage_with(&["aaa"]);
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(run_periodic(
            client,
            storage.clone(),
            Duration::from_millis(10),
            50,
            rx,
        ));
        for _ in 0..200 {
            if storage.lock().count().unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        task.await.unwrap();

        mock.assert_hits(1);
        assert_eq!(storage.lock().count().unwrap(), 0);
    }

    #[tokio::test]
    async fn held_storage_lock_does_not_stall_runtime() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST).path("/rest/v1/captures");
            then.status(201);
        });
        let client = SupabaseClient::new(&config(&server.base_url())).unwrap().unwrap();
        let storage = storage_with(&["aaa"]);

        // Another thread (the face worker in production) holds the lock for a while.
        let held = storage.clone();
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            let _guard = held.lock();
            locked_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(200));
        });
        locked_rx.recv().unwrap();

        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let ticker = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let report = sync_pending(&client, &storage, 50).await.unwrap();
        ticker.abort();
        holder.join().unwrap();

        mock.assert();
        assert_eq!(report.sent, 1);
        assert!(ticks.load(Ordering::SeqCst) >= 10, "runtime stalled while waiting for the lock");
    }
}
