// ===============================
// src/facade.rs
// ===============================
//
// Resource facade: the per-fixture feed transport as the listener sees it.
// - MockFacade   : random-walk odds generator, also walks the match status
//                  forward and bumps the epoch on every status change
// - RemoteFacade : HTTP snapshot endpoint + WebSocket update stream
//                  (payloads are JSON-encoded `Fixture`s)
//
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use parking_lot::Mutex;
use rand::Rng;
use thiserror::Error;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::domain::{
    EpochChangeReason, Fixture, Market, MatchStatus, Selection, SELECTION_ACTIVE, SELECTION_INACTIVE,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FacadeError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("facade misconfigured: {0}")]
    Configuration(String),
    #[error("cancelled")]
    Cancelled,
}

impl FacadeError {
    /// Unauthorized / misconfigured facades will not heal by retrying.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, FacadeError::Unauthorized(_) | FacadeError::Configuration(_))
    }
}

pub type UpdateStream = BoxStream<'static, Result<Fixture, FacadeError>>;

#[async_trait]
pub trait ResourceFacade: Send + Sync {
    fn fixture_id(&self) -> &str;
    fn sport(&self) -> &str;
    async fn get_snapshot(&self) -> Result<Fixture, FacadeError>;
    /// Stream ends when the connection drops or `disconnect` is called.
    async fn subscribe_updates(&self) -> Result<UpdateStream, FacadeError>;
    async fn disconnect(&self);
}

// -----------------------------------------------------------------------------
// Mock
// -----------------------------------------------------------------------------

const MOCK_STATUS_PATH: [MatchStatus; 4] = [
    MatchStatus::Setup,
    MatchStatus::PreMatch,
    MatchStatus::InRunning,
    MatchStatus::MatchOver,
];

struct MockBook {
    fixture: Fixture,
    ticks_in_status: u32,
}

impl MockBook {
    fn new(fixture_id: &str, sport: &str) -> Self {
        let market = |id: &str, name: &str, base: f64| Market {
            id: id.into(),
            name: Some(name.into()),
            is_pending: Some(false),
            is_resulted: Some(false),
            selections: ["home", "away"]
                .iter()
                .enumerate()
                .map(|(i, side)| Selection {
                    id: format!("{id}-{side}"),
                    name: Some(side.to_string()),
                    price: Some(base + i as f64 * 0.4),
                    tradable: Some(true),
                    status: Some(SELECTION_ACTIVE.into()),
                })
                .collect(),
            ..Default::default()
        };
        Self {
            fixture: Fixture {
                id: fixture_id.into(),
                sport: sport.into(),
                description: Some(format!("{fixture_id} (mock)")),
                start_time: Some(chrono::Utc::now() + chrono::Duration::hours(1)),
                sequence: 1,
                epoch: 1,
                match_status: Some(MatchStatus::Setup),
                markets: vec![
                    market(&format!("{fixture_id}-winner"), "Match Winner", 1.9),
                    market(&format!("{fixture_id}-handicap"), "Handicap", 1.8),
                ],
                ..Default::default()
            },
            ticks_in_status: 0,
        }
    }

    /// Advance one tick and return the delta to publish.
    fn step(&mut self, ticks_per_status: u32) -> Fixture {
        self.fixture.sequence += 1;
        self.fixture.last_epoch_change_reasons.clear();
        self.ticks_in_status += 1;

        let status = self.fixture.match_status.unwrap_or_default();
        if self.ticks_in_status >= ticks_per_status && !status.is_over() {
            let idx = MOCK_STATUS_PATH.iter().position(|s| *s == status).unwrap_or(0);
            let next = MOCK_STATUS_PATH[(idx + 1).min(MOCK_STATUS_PATH.len() - 1)];
            self.fixture.match_status = Some(next);
            self.fixture.epoch += 1;
            self.fixture.last_epoch_change_reasons = vec![EpochChangeReason::MatchStatus];
            self.ticks_in_status = 0;
            if next.is_over() {
                for m in self.fixture.markets.iter_mut() {
                    m.is_resulted = Some(true);
                    for s in m.selections.iter_mut() {
                        s.status = Some(SELECTION_INACTIVE.into());
                    }
                }
            }
            return self.fixture.clone();
        }

        // jangan simpan ThreadRng melewati .await
        let mut rng = rand::thread_rng();
        let mi = rng.gen_range(0..self.fixture.markets.len());
        let market = &mut self.fixture.markets[mi];
        let si = rng.gen_range(0..market.selections.len());
        let sel = &mut market.selections[si];
        let step = rng.gen_range(-3..=3) as f64 * 0.01;
        let px = (sel.price.unwrap_or(2.0) + step).max(1.01);
        sel.price = Some((px * 100.0).round() / 100.0);

        let changed = Market {
            id: market.id.clone(),
            selections: vec![Selection {
                id: sel.id.clone(),
                price: sel.price,
                ..Default::default()
            }],
            ..Default::default()
        };
        Fixture { markets: vec![changed], ..self.fixture.header() }
    }
}

pub struct MockFacade {
    fixture_id: String,
    sport: String,
    tick: Duration,
    ticks_per_status: u32,
    book: Arc<Mutex<MockBook>>,
    generation: Arc<AtomicU64>,
}

impl MockFacade {
    pub fn new(fixture_id: impl Into<String>, sport: impl Into<String>, tick: Duration) -> Self {
        let fixture_id = fixture_id.into();
        let sport = sport.into();
        let book = MockBook::new(&fixture_id, &sport);
        Self {
            fixture_id,
            sport,
            tick,
            ticks_per_status: 200,
            book: Arc::new(Mutex::new(book)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_ticks_per_status(mut self, n: u32) -> Self {
        self.ticks_per_status = n.max(1);
        self
    }
}

#[async_trait]
impl ResourceFacade for MockFacade {
    fn fixture_id(&self) -> &str {
        &self.fixture_id
    }

    fn sport(&self) -> &str {
        &self.sport
    }

    async fn get_snapshot(&self) -> Result<Fixture, FacadeError> {
        Ok(self.book.lock().fixture.clone())
    }

    async fn subscribe_updates(&self) -> Result<UpdateStream, FacadeError> {
        let my_gen = self.generation.load(Ordering::SeqCst);
        let generation = self.generation.clone();
        let book = self.book.clone();
        let tick = self.tick;
        let per_status = self.ticks_per_status;

        let s = stream::unfold((), move |_| {
            let generation = generation.clone();
            let book = book.clone();
            async move {
                tokio::time::sleep(tick).await;
                if generation.load(Ordering::SeqCst) != my_gen {
                    return None;
                }
                let delta = {
                    let mut b = book.lock();
                    if b.fixture.match_status.map(|s| s.is_over()).unwrap_or(false) {
                        return None;
                    }
                    b.step(per_status)
                };
                Some((Ok(delta), ()))
            }
        });
        Ok(s.boxed())
    }

    async fn disconnect(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

// -----------------------------------------------------------------------------
// Remote (HTTP snapshot + WS updates)
// -----------------------------------------------------------------------------

pub struct RemoteFacade {
    fixture_id: String,
    sport: String,
    rest_url: String,
    ws_url: String,
    token: Option<String>,
    http: reqwest::Client,
    stop_tx: watch::Sender<u64>,
}

impl RemoteFacade {
    pub fn new(
        fixture_id: impl Into<String>,
        sport: impl Into<String>,
        rest_url: impl Into<String>,
        ws_url: impl Into<String>,
        token: Option<String>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(0u64);
        Self {
            fixture_id: fixture_id.into(),
            sport: sport.into(),
            rest_url: rest_url.into(),
            ws_url: ws_url.into(),
            token,
            http: reqwest::Client::new(),
            stop_tx,
        }
    }

    fn snapshot_url(&self) -> String {
        format!("{}/fixtures/{}/snapshot", self.rest_url.trim_end_matches('/'), self.fixture_id)
    }

    fn stream_url(&self) -> String {
        format!("{}/fixtures/{}", self.ws_url.trim_end_matches('/'), self.fixture_id)
    }
}

fn parse_frame(fixture_id: &str, frame: Result<Message, tungstenite::Error>) -> Option<Result<Fixture, FacadeError>> {
    match frame {
        Ok(m) if m.is_text() => {
            let txt = match m.into_text() {
                Ok(t) => t,
                Err(e) => return Some(Err(FacadeError::MalformedPayload(e.to_string()))),
            };
            match serde_json::from_str::<Fixture>(&txt) {
                Ok(f) if f.id == fixture_id => Some(Ok(f)),
                Ok(f) => {
                    warn!(expected = %fixture_id, got = %f.id, "frame for another fixture, dropped");
                    None
                }
                Err(e) => Some(Err(FacadeError::MalformedPayload(e.to_string()))),
            }
        }
        // ping/pong/binary
        Ok(_) => None,
        Err(e) => Some(Err(FacadeError::ConnectionLost(e.to_string()))),
    }
}

#[async_trait]
impl ResourceFacade for RemoteFacade {
    fn fixture_id(&self) -> &str {
        &self.fixture_id
    }

    fn sport(&self) -> &str {
        &self.sport
    }

    async fn get_snapshot(&self) -> Result<Fixture, FacadeError> {
        let mut req = self.http.get(self.snapshot_url());
        if let Some(t) = &self.token {
            req = req.bearer_auth(t);
        }
        let rsp = req
            .send()
            .await
            .map_err(|e| FacadeError::ConnectionLost(e.to_string()))?;

        let code = rsp.status();
        if code == reqwest::StatusCode::UNAUTHORIZED || code == reqwest::StatusCode::FORBIDDEN {
            return Err(FacadeError::Unauthorized(format!("snapshot returned {code}")));
        }
        if !code.is_success() {
            return Err(FacadeError::ConnectionLost(format!("snapshot returned {code}")));
        }

        let body = rsp
            .text()
            .await
            .map_err(|e| FacadeError::ConnectionLost(e.to_string()))?;
        let fixture: Fixture =
            serde_json::from_str(&body).map_err(|e| FacadeError::MalformedPayload(e.to_string()))?;
        debug!(fixture_id = %self.fixture_id, sequence = fixture.sequence, "snapshot fetched");
        Ok(fixture)
    }

    async fn subscribe_updates(&self) -> Result<UpdateStream, FacadeError> {
        let ws_url = self.stream_url();
        let url = Url::parse(&ws_url).map_err(|e| FacadeError::Configuration(format!("{ws_url}: {e}")))?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| FacadeError::Configuration(e.to_string()))?;
        if let Some(t) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {t}"))
                .map_err(|e| FacadeError::Configuration(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        info!(%ws_url, "connecting fixture stream");
        let (ws, _resp) = connect_async(request).await.map_err(|e| match e {
            tungstenite::Error::Http(rsp)
                if rsp.status() == StatusCode::UNAUTHORIZED || rsp.status() == StatusCode::FORBIDDEN =>
            {
                FacadeError::Unauthorized(format!("stream handshake returned {}", rsp.status()))
            }
            other => FacadeError::ConnectionLost(other.to_string()),
        })?;

        let mut stop_rx = self.stop_tx.subscribe();
        let fixture_id = self.fixture_id.clone();
        let s = ws
            .filter_map(move |frame| futures_util::future::ready(parse_frame(&fixture_id, frame)))
            .take_until(async move {
                let _ = stop_rx.changed().await;
            });
        Ok(s.boxed())
    }

    async fn disconnect(&self) {
        self.stop_tx.send_modify(|g| *g += 1);
        debug!(fixture_id = %self.fixture_id, "fixture stream disconnect requested");
    }
}
