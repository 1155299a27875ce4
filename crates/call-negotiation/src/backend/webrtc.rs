use std::sync::Arc;

use async_trait::async_trait;
use call_proto::{DescriptionKind, PathCandidate, SessionDescription};
use parking_lot::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::{NegotiationBackend, TransportEvents};
use crate::{
    config::{IceServer, ProfileSettings},
    error::{to_backend_error, CallError},
    machine::TransportStatus,
};

pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

/// Local capture devices. Implementations resolve to the tracks to attach, or
/// `CallError::PermissionDenied` when the user refuses access.
#[async_trait]
pub trait MediaSource: Send + Sync + 'static {
    async fn acquire(&self) -> Result<Vec<LocalTrack>, CallError>;

    async fn release(&self) {}
}

/// Audio and video sample tracks the application writes captured frames into.
pub struct SampleTrackSource {
    audio: Arc<TrackLocalStaticSample>,
    video: Arc<TrackLocalStaticSample>,
}

impl SampleTrackSource {
    pub fn new(stream_id: &str) -> Self {
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            stream_id.to_owned(),
        ));
        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            stream_id.to_owned(),
        ));
        Self { audio, video }
    }

    pub fn audio(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.audio)
    }

    pub fn video(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.video)
    }
}

#[async_trait]
impl MediaSource for SampleTrackSource {
    async fn acquire(&self) -> Result<Vec<LocalTrack>, CallError> {
        let audio: LocalTrack = self.audio();
        let video: LocalTrack = self.video();
        Ok(vec![audio, video])
    }
}

pub struct WebRtcBackend {
    api: API,
    media: Arc<dyn MediaSource>,
    tracks: Mutex<Vec<LocalTrack>>,
    link: Mutex<Option<Arc<RTCPeerConnection>>>,
}

impl WebRtcBackend {
    pub fn new(media: Arc<dyn MediaSource>) -> Result<Self, CallError> {
        Ok(Self {
            api: build_api(SettingEngine::default())?,
            media,
            tracks: Mutex::new(Vec::new()),
            link: Mutex::new(None),
        })
    }

    fn current(&self) -> Result<Arc<RTCPeerConnection>, CallError> {
        self.link.lock().clone().ok_or(CallError::NoLink)
    }
}

fn build_api(setting: SettingEngine) -> Result<API, CallError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_backend_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_backend_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone(),
        credential: server.credential.clone(),
        ..Default::default()
    }
}

fn rtc_configuration(settings: &ProfileSettings) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: settings.ice_servers.iter().map(rtc_ice_server).collect(),
        ice_candidate_pool_size: settings.candidate_pool_size,
        ..Default::default()
    }
}

fn transport_status(state: RTCIceConnectionState) -> Option<TransportStatus> {
    match state {
        RTCIceConnectionState::New => Some(TransportStatus::New),
        RTCIceConnectionState::Checking => Some(TransportStatus::Checking),
        RTCIceConnectionState::Connected => Some(TransportStatus::Connected),
        RTCIceConnectionState::Completed => Some(TransportStatus::Completed),
        RTCIceConnectionState::Disconnected => Some(TransportStatus::Disconnected),
        RTCIceConnectionState::Failed => Some(TransportStatus::Failed),
        RTCIceConnectionState::Closed => Some(TransportStatus::Closed),
        _ => None,
    }
}

fn path_candidate(init: RTCIceCandidateInit) -> PathCandidate {
    PathCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

#[async_trait]
impl NegotiationBackend for WebRtcBackend {
    async fn acquire_media(&self) -> Result<(), CallError> {
        let tracks = self.media.acquire().await?;
        *self.tracks.lock() = tracks;
        Ok(())
    }

    async fn release_media(&self) {
        self.tracks.lock().clear();
        self.media.release().await;
    }

    async fn open(&self, settings: ProfileSettings, events: TransportEvents) -> Result<(), CallError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_configuration(&settings))
                .await
                .map_err(to_backend_error)?,
        );

        let tracks = self.tracks.lock().clone();
        for track in tracks {
            pc.add_track(track).await.map_err(to_backend_error)?;
        }

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => events.candidate(path_candidate(init)),
                    Err(err) => {
                        tracing::warn!(target = "webrtc", error = %err, "candidate encode failed")
                    }
                }
            })
        }));

        let state_events = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                tracing::debug!(
                    target = "webrtc",
                    attempt = %events.attempt(),
                    ?state,
                    "ice connection state changed"
                );
                if let Some(status) = transport_status(state) {
                    events.status(status);
                }
            })
        }));

        tracing::debug!(
            target = "webrtc",
            attempt = %events.attempt(),
            profile = %settings.profile,
            pool = settings.candidate_pool_size,
            servers = settings.ice_servers.len(),
            "peer connection created"
        );

        let previous = self.link.lock().replace(pc);
        if let Some(previous) = previous {
            if let Err(err) = previous.close().await {
                tracing::debug!(target = "webrtc", error = %err, "closing replaced link failed");
            }
        }
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, CallError> {
        let pc = self.current()?;
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = pc
            .create_offer(Some(options))
            .await
            .map_err(to_backend_error)?;
        let sdp = offer.sdp.clone();
        pc.set_local_description(offer)
            .await
            .map_err(to_backend_error)?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let pc = self.current()?;
        let answer = pc.create_answer(None).await.map_err(to_backend_error)?;
        let sdp = answer.sdp.clone();
        pc.set_local_description(answer)
            .await
            .map_err(to_backend_error)?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), CallError> {
        let pc = self.current()?;
        let remote = match description.kind {
            DescriptionKind::Offer => RTCSessionDescription::offer(description.sdp),
            DescriptionKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(to_backend_error)?;
        pc.set_remote_description(remote)
            .await
            .map_err(to_backend_error)
    }

    async fn add_candidate(&self, candidate: PathCandidate) -> Result<(), CallError> {
        let pc = self.current()?;
        pc.add_ice_candidate(RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        })
        .await
        .map_err(to_backend_error)
    }

    async fn close(&self) {
        let link = self.link.lock().take();
        if let Some(pc) = link {
            if let Err(err) = pc.close().await {
                tracing::debug!(target = "webrtc", error = %err, "closing link failed");
            }
        }
    }
}
