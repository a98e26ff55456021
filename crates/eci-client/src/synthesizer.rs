//! Caller-facing speech API.
//!
//! A [`Synthesizer`] owns an [`EngineClient`] and a [`SynthQueue`]. `speak`
//! turns a speech sequence into one batch; the queue's worker executes it
//! against the host while the receiver and audio worker play the result.
//! Parameter setters act immediately on the caller's thread and log their
//! failures instead of returning them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::audio::{self, OutputDevice};
use crate::client::EngineClient;
use crate::config::ClientConfig;
use crate::error::Result;
use crate::params::{ENGINE_VOICE_PARAM, VoiceParam};
use crate::protocol::{
    AddTextArgs, CopyVoiceArgs, InitializeArgs, InsertIndexArgs, ParamsReply, Payload,
    SetParamArgs, SetVoiceParamArgs, commands, from_payload,
};
use crate::session::{IndexCallback, IndexMark, Session};
use crate::speech::{
    Latin1Encoder, PlanContext, SpeechItem, SpeechPlan, SpeechStyle, TextEncoder, rate_percent,
};
use crate::synth_queue::{BatchExecutor, CommandBatch, SynthOp, SynthQueue};

/// How the host should initialize the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Engine library the host loads.
    pub engine_path: PathBuf,
    /// Voice data directory. Defaults to the engine library's directory.
    pub data_directory: Option<PathBuf>,
    /// Three-letter language code, e.g. `enu`.
    pub language: String,
    pub voice_variant: i32,
    pub style: SpeechStyle,
}

impl EngineOptions {
    pub fn new(engine_path: impl Into<PathBuf>) -> Self {
        Self {
            engine_path: engine_path.into(),
            data_directory: None,
            language: "enu".to_owned(),
            voice_variant: 0,
            style: SpeechStyle::default(),
        }
    }

    fn data_directory(&self) -> PathBuf {
        self.data_directory.clone().unwrap_or_else(|| {
            self.engine_path
                .parent()
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
        })
    }

    fn initialize_args(&self) -> InitializeArgs {
        InitializeArgs {
            engine_path: self.engine_path.to_string_lossy().into_owned(),
            data_directory: self.data_directory().to_string_lossy().into_owned(),
            language: self.language.clone(),
            enable_abbreviation_dict: self.style.abbreviation_dict,
            enable_phrase_prediction: self.style.phrase_prediction,
            voice_variant: self.voice_variant,
        }
    }
}

/// Whether the engine library named in `options` is present.
pub fn engine_available(options: &EngineOptions) -> bool {
    options.engine_path.is_file()
}

/// Engine commands issued through the client, with the parameter mirrors
/// kept in step.
struct Engine {
    client: Arc<EngineClient>,
    session: Arc<Session>,
}

impl Engine {
    fn add_text(&self, text: &[u8]) -> Result<()> {
        self.client.invoke(
            commands::ADD_TEXT,
            &AddTextArgs {
                text: text.to_vec(),
            },
        )?;
        Ok(())
    }

    fn insert_index(&self, value: u32) -> Result<()> {
        self.client
            .invoke(commands::INSERT_INDEX, &InsertIndexArgs { value })?;
        Ok(())
    }

    fn synthesize(&self) -> Result<()> {
        self.client.call(commands::SYNTHESIZE, Payload::new())?;
        Ok(())
    }

    /// Only persistent sets update the base mirror, preferring the value
    /// the host reports back.
    fn set_voice_param(&self, param: VoiceParam, value: i32, temporary: bool) -> Result<()> {
        let reply: ParamsReply = from_payload(self.client.invoke(
            commands::SET_VOICE_PARAM,
            &SetVoiceParamArgs {
                param_id: param.id(),
                value,
                temporary,
            },
        )?)?;
        if !temporary {
            let stored = reply
                .voice_params
                .get(&param.id())
                .copied()
                .unwrap_or(value);
            self.session.voice_params.set(param.id(), stored);
        }
        Ok(())
    }

    fn prosody(&self, param: VoiceParam, multiplier: f64, offset: i32) -> Result<()> {
        let base = self.session.voice_params.get(param.id());
        self.set_voice_param(param, param.scaled(base, multiplier, offset), true)
    }

    /// The host re-reads voice parameters after a voice switch and may pick
    /// up temporary prosody values, so the reply's `voiceParams` are ignored
    /// and the saved base values are pushed back instead.
    fn set_voice(&self, voice: i32) -> Result<()> {
        let saved = self.session.voice_params.snapshot();
        let reply: ParamsReply = from_payload(self.client.invoke(
            commands::SET_PARAM,
            &SetParamArgs {
                param_id: ENGINE_VOICE_PARAM,
                value: voice,
            },
        )?)?;
        self.session.params.merge(&reply.params);
        if !reply.params.contains_key(&ENGINE_VOICE_PARAM) {
            self.session.params.set(ENGINE_VOICE_PARAM, voice);
        }

        for (param_id, value) in saved {
            self.session.voice_params.set(param_id, value);
            let restored = self.client.invoke(
                commands::SET_VOICE_PARAM,
                &SetVoiceParamArgs {
                    param_id,
                    value,
                    temporary: false,
                },
            );
            if let Err(e) = restored {
                debug!(param_id, value, error = %e, "Failed to restore voice parameter");
            }
        }
        debug!(voice, "Voice changed");
        Ok(())
    }

    fn set_variant(&self, variant: i32) -> Result<()> {
        let reply: ParamsReply = from_payload(
            self.client
                .invoke(commands::COPY_VOICE, &CopyVoiceArgs { variant })?,
        )?;
        self.session.voice_params.merge(&reply.voice_params);
        Ok(())
    }
}

impl BatchExecutor for Engine {
    fn execute(&self, op: &SynthOp) -> Result<()> {
        match op {
            SynthOp::AddText(text) => self.add_text(text),
            SynthOp::InsertIndex(value) => self.insert_index(*value),
            SynthOp::Synthesize => self.synthesize(),
            SynthOp::Prosody {
                param,
                multiplier,
                offset,
            } => self.prosody(*param, *multiplier, *offset),
            SynthOp::SetVoice(voice) => {
                let params = &self.session.params;
                if params.contains(ENGINE_VOICE_PARAM) && params.get(ENGINE_VOICE_PARAM) == *voice {
                    return Ok(());
                }
                self.set_voice(*voice)
            }
        }
    }
}

/// Speech synthesizer backed by an out-of-process engine host.
pub struct Synthesizer {
    client: Arc<EngineClient>,
    engine: Arc<Engine>,
    queue: SynthQueue,
    encoder: Box<dyn TextEncoder>,
    style: RwLock<SpeechStyle>,
}

impl Synthesizer {
    /// Launch the host, open the default output device and initialize the
    /// engine.
    pub fn start(
        config: ClientConfig,
        options: &EngineOptions,
        on_index: Option<IndexCallback>,
    ) -> Result<Self> {
        let device = audio::open_default(config.device_buffer_ms);
        Self::start_with_device(config, options, on_index, device)
    }

    /// [`start`](Self::start) with an explicit output device.
    pub fn start_with_device(
        config: ClientConfig,
        options: &EngineOptions,
        on_index: Option<IndexCallback>,
        device: Arc<dyn OutputDevice>,
    ) -> Result<Self> {
        let client = Arc::new(EngineClient::new(config));
        client.session().set_index_callback(on_index);
        client.start(device)?;
        Self::with_client(client, options)
    }

    /// Initialize the engine over an already running client.
    pub fn with_client(client: Arc<EngineClient>, options: &EngineOptions) -> Result<Self> {
        let session = Arc::clone(client.session());
        let engine = Arc::new(Engine {
            client: Arc::clone(&client),
            session: Arc::clone(&session),
        });
        let join_timeout = client.config().worker_join_timeout;
        let queue = SynthQueue::new(
            Arc::clone(&engine) as Arc<dyn BatchExecutor>,
            Arc::clone(&session),
            join_timeout,
        );
        let synth = Self {
            client,
            engine,
            queue,
            encoder: Box::new(Latin1Encoder),
            style: RwLock::new(options.style),
        };
        synth.queue.ensure_started()?;
        synth.initialize(options)?;
        Ok(synth)
    }

    /// Replace the text encoder.
    #[must_use]
    pub fn with_encoder(mut self, encoder: impl TextEncoder + 'static) -> Self {
        self.encoder = Box::new(encoder);
        self
    }

    fn initialize(&self, options: &EngineOptions) -> Result<()> {
        let args = options.initialize_args();
        info!(
            engine = %args.engine_path,
            language = %args.language,
            variant = args.voice_variant,
            "Initializing engine"
        );
        let reply: ParamsReply =
            from_payload(self.client.invoke(commands::INITIALIZE, &args)?)?;
        let session = self.client.session();
        session.params.merge(&reply.params);
        session.voice_params.merge(&reply.voice_params);
        debug!(
            params = reply.params.len(),
            voice_params = reply.voice_params.len(),
            "Engine initialized"
        );
        Ok(())
    }

    fn session(&self) -> &Session {
        self.client.session()
    }

    /// Queue a speech sequence. Returns once the batch is queued; audio and
    /// index notifications follow asynchronously.
    ///
    /// A sequence without text or breaks is applied on the spot: its
    /// parameter changes run immediately and each index is reported at
    /// once, followed by [`IndexMark::Done`].
    pub fn speak(&self, items: Vec<SpeechItem>) -> Result<()> {
        let session = self.session();
        let ctx = PlanContext {
            style: *self.style.read(),
            volume: session.voice_params.get(VoiceParam::Volume.id()),
            rate_percent: rate_percent(session.voice_params.get(VoiceParam::Rate.id())),
        };
        let plan = SpeechPlan::build(items, &ctx, self.encoder.as_ref());

        if !plan.has_speech {
            for op in plan
                .ops
                .iter()
                .filter(|op| !matches!(op, SynthOp::InsertIndex(_)))
            {
                if let Err(e) = self.engine.execute(op) {
                    warn!(?op, error = %e, "Synthesis command failed");
                }
            }
            for index in plan.indexes {
                session.notify_index(IndexMark::Reached(index));
            }
            session.notify_index(IndexMark::Done);
            return Ok(());
        }

        let batch = CommandBatch {
            ops: plan.ops,
            epoch: session.epoch.get(),
        };
        debug!(ops = batch.ops.len(), epoch = batch.epoch, "Queueing utterance");
        self.queue.submit(batch)
    }

    /// Silence everything spoken or queued so far.
    pub fn stop(&self) {
        self.client.stop();
    }

    pub fn pause(&self, paused: bool) {
        self.client.pause(paused);
    }

    /// Stop the synthesis worker and shut the host down.
    pub fn terminate(&self) {
        self.queue.stop();
        self.client.shutdown();
    }

    pub fn style(&self) -> SpeechStyle {
        *self.style.read()
    }

    pub fn set_style(&self, style: SpeechStyle) {
        *self.style.write() = style;
    }

    /// Base value of a voice parameter.
    pub fn voice_param(&self, param: VoiceParam) -> i32 {
        self.session().voice_params.get(param.id())
    }

    /// Set a voice parameter's base value.
    pub fn set_voice_param(&self, param: VoiceParam, value: i32) {
        if let Err(e) = self.engine.set_voice_param(param, value, false) {
            warn!(?param, value, error = %e, "Failed to set voice parameter");
        }
    }

    /// Set a voice parameter without touching its base value.
    pub fn set_voice_param_temporary(&self, param: VoiceParam, value: i32) {
        if let Err(e) = self.engine.set_voice_param(param, value, true) {
            warn!(?param, value, error = %e, "Failed to set temporary voice parameter");
        }
    }

    /// Temporarily set `base * multiplier + offset`, clamped to the
    /// parameter's range.
    pub fn apply_prosody(&self, param: VoiceParam, multiplier: f64, offset: i32) {
        if let Err(e) = self.engine.prosody(param, multiplier, offset) {
            warn!(?param, multiplier, offset, error = %e, "Failed to apply prosody");
        }
    }

    /// Switch voice/language, keeping the base voice parameters.
    pub fn set_voice(&self, voice: i32) {
        if let Err(e) = self.engine.set_voice(voice) {
            warn!(voice, error = %e, "Failed to set voice");
        }
    }

    pub fn set_variant(&self, variant: i32) {
        if let Err(e) = self.engine.set_variant(variant) {
            warn!(variant, error = %e, "Failed to set variant");
        }
    }

    /// Last known value of an engine parameter.
    pub fn engine_param(&self, id: u32) -> Option<i32> {
        let params = &self.session().params;
        params.contains(id).then(|| params.get(id))
    }

    pub fn last_index(&self) -> Option<u32> {
        self.session().last_index()
    }

    pub fn is_speaking(&self) -> bool {
        self.session().is_speaking()
    }

    pub fn client(&self) -> &Arc<EngineClient> {
        &self.client
    }
}

impl Drop for Synthesizer {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::thread;
    use std::time::{Duration, Instant};

    use parking_lot::Mutex;
    use serde_json::json;

    use crate::audio::MemoryDevice;
    use crate::host::HostLink;
    use crate::protocol::{Message, events};
    use crate::transport::tests::pair;

    type Log = Arc<Mutex<Vec<(String, Payload)>>>;

    /// In-process engine host keeping a live voice parameter table. A voice
    /// switch answers with whatever the live table holds, temporary values
    /// included.
    fn fake_host(log: Log) -> (HostLink, thread::JoinHandle<()>) {
        let (client_side, host_side) = pair();
        let (reader, writer) = client_side.split().unwrap();
        let link = HostLink {
            connection: client_side,
            reader,
            writer,
        };
        let handle = thread::spawn(move || {
            let (mut r, mut w) = host_side.split().unwrap();
            let mut live: BTreeMap<u32, i32> =
                [(1, 50), (2, 65), (3, 30), (4, 0), (5, 0), (6, 50), (7, 92)].into();
            while let Ok(Some(Message::Command {
                id,
                command,
                payload,
            })) = r.recv()
            {
                log.lock().push((command.clone(), payload.clone()));
                let reply = match command.as_str() {
                    commands::INITIALIZE => json!({"params": {"9": 65536}, "voiceParams": live}),
                    commands::SET_VOICE_PARAM => {
                        let args: SetVoiceParamArgs = from_payload(payload).unwrap();
                        live.insert(args.param_id, args.value);
                        json!({"voiceParams": live})
                    }
                    commands::SET_PARAM => {
                        let args: SetParamArgs = from_payload(payload).unwrap();
                        json!({"params": {args.param_id.to_string(): args.value}, "voiceParams": live})
                    }
                    commands::COPY_VOICE => {
                        live.insert(2, 40);
                        json!({"voiceParams": live})
                    }
                    commands::STOP => continue,
                    _ => json!({}),
                };
                let serde_json::Value::Object(reply) = reply else {
                    unreachable!()
                };
                w.send(&Message::reply(id, reply)).unwrap();

                if command == commands::SYNTHESIZE {
                    let mut marker = Payload::new();
                    marker.insert("final".into(), true.into());
                    w.send(&Message::event(events::AUDIO, marker)).unwrap();
                }
                if command == commands::DELETE {
                    let _ = host_side.close();
                    break;
                }
            }
        });
        (link, handle)
    }

    struct Fixture {
        synth: Synthesizer,
        log: Log,
        marks: Arc<Mutex<Vec<IndexMark>>>,
        host: thread::JoinHandle<()>,
    }

    fn fixture() -> Fixture {
        let log: Log = Arc::default();
        let (link, host) = fake_host(Arc::clone(&log));
        let marks = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&marks);

        let client = Arc::new(EngineClient::new(ClientConfig::default()));
        client
            .session()
            .set_index_callback(Some(Arc::new(move |m: IndexMark| sink.lock().push(m))));
        client.attach(link, Arc::new(MemoryDevice::new())).unwrap();
        let synth = Synthesizer::with_client(client, &EngineOptions::new("/opt/eci/eci.so")).unwrap();
        Fixture {
            synth,
            log,
            marks,
            host,
        }
    }

    fn commands_seen(log: &Log) -> Vec<String> {
        log.lock().iter().map(|(c, _)| c.clone()).collect()
    }

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn initialize_seeds_both_tables() {
        let f = fixture();
        assert_eq!(f.synth.engine_param(ENGINE_VOICE_PARAM), Some(65536));
        assert_eq!(f.synth.voice_param(VoiceParam::Volume), 92);

        let (command, payload) = f.log.lock()[0].clone();
        assert_eq!(command, commands::INITIALIZE);
        assert_eq!(payload["eciPath"], "/opt/eci/eci.so");
        assert_eq!(payload["dataDirectory"], "/opt/eci");
        assert_eq!(payload["language"], "enu");
    }

    #[test]
    fn temporary_set_leaves_the_base_alone() {
        let f = fixture();
        f.synth.set_voice_param(VoiceParam::Pitch, 80);
        f.synth.set_voice_param_temporary(VoiceParam::Pitch, 100);
        assert_eq!(f.synth.voice_param(VoiceParam::Pitch), 80);

        f.synth.apply_prosody(VoiceParam::Pitch, 1.0, 40);
        assert_eq!(f.synth.voice_param(VoiceParam::Pitch), 80);
        let (_, last) = f.log.lock().last().cloned().unwrap();
        assert_eq!(last["value"], 100);
        assert_eq!(last["temporary"], true);
    }

    #[test]
    fn voice_switch_does_not_promote_temporary_values() {
        let f = fixture();
        f.synth.set_voice_param(VoiceParam::Pitch, 80);
        f.synth.set_voice_param_temporary(VoiceParam::Pitch, 100);

        f.synth.set_voice(131_072);
        assert_eq!(f.synth.voice_param(VoiceParam::Pitch), 80);
        assert_eq!(f.synth.engine_param(ENGINE_VOICE_PARAM), Some(131_072));

        let log = f.log.lock();
        let restored: Vec<_> = log
            .iter()
            .skip_while(|(c, _)| c != commands::SET_PARAM)
            .skip(1)
            .filter(|(c, _)| c == commands::SET_VOICE_PARAM)
            .collect();
        assert_eq!(restored.len(), 7);
        assert!(restored.iter().all(|(_, p)| p["temporary"] == false));
        assert!(
            restored
                .iter()
                .any(|(_, p)| p["paramId"] == 2 && p["value"] == 80)
        );
    }

    #[test]
    fn variant_merges_voice_params() {
        let f = fixture();
        f.synth.set_variant(3);
        assert_eq!(f.synth.voice_param(VoiceParam::Pitch), 40);
    }

    #[test]
    fn speak_runs_the_batch_and_reports_done() {
        let f = fixture();
        f.synth
            .speak(vec!["Hello there.".into(), SpeechItem::Index(7)])
            .unwrap();

        wait_until("done", || f.marks.lock().contains(&IndexMark::Done));
        let seen = commands_seen(&f.log);
        let tail: Vec<_> = seen.iter().rev().take(4).rev().cloned().collect();
        assert_eq!(
            tail,
            vec!["addText", "insertIndex", "insertIndex", "synthesize"]
        );
        assert!(f.synth.is_speaking());
    }

    #[test]
    fn textless_speak_reports_indexes_immediately() {
        let f = fixture();
        let before = f.log.lock().len();
        f.synth
            .speak(vec![
                SpeechItem::Index(4),
                SpeechItem::Pitch(crate::speech::ProsodyChange::offset(30)),
                SpeechItem::Index(5),
            ])
            .unwrap();

        assert_eq!(
            *f.marks.lock(),
            vec![
                IndexMark::Reached(4),
                IndexMark::Reached(5),
                IndexMark::Done
            ]
        );
        assert_eq!(f.synth.last_index(), Some(5));
        let issued: Vec<_> = commands_seen(&f.log)[before..].to_vec();
        assert_eq!(issued, vec![commands::SET_VOICE_PARAM; 4]);
    }

    #[test]
    fn terminate_deletes_the_engine() {
        let f = fixture();
        f.synth.terminate();
        f.host.join().unwrap();
        assert_eq!(commands_seen(&f.log).last().map(String::as_str), Some("delete"));
        assert!(!f.synth.client().is_running());
    }
}
