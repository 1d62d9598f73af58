//! Round-trips a recorded session through `SessionRecorder` and back
//! through `SessionPlayer`.

use chrono::{DateTime, Utc};
use utterance_events::{AsrEvent, SessionConfig};
use utterance_recorder::{PlaybackControl, ReplayInput, ReplayOutcome, SessionPlayer, SessionRecorder};

fn ts(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap()
}

fn asr(text: &str, is_final: bool, at: DateTime<Utc>) -> AsrEvent {
    AsrEvent {
        text: text.to_string(),
        is_final,
        speaker_id: None,
        words: None,
        is_utterance_end: false,
        received_at: at,
    }
}

#[tokio::test]
async fn recorded_asr_stream_replays_in_order_with_matching_text() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.jsonl");

    let recorder = SessionRecorder::create(&path, ts(0), SessionConfig::default(), 2000).unwrap();
    recorder.record_asr_event(asr("what is a", false, ts(0))).unwrap();
    recorder.record_asr_event(asr("what is a lock", false, ts(200))).unwrap();
    recorder
        .record_asr_event(asr("what is a lock statement?", true, ts(400)))
        .unwrap();
    recorder.record_utterance_end_signal(ts(400)).unwrap();

    let player = SessionPlayer::load(&path).unwrap();
    assert_eq!(player.input_record_count(), 4);
    assert_eq!(player.skipped_lines(), 0);

    let control = PlaybackControl::new();
    let mut replayed = Vec::new();
    let outcome = player
        .replay_into(&control, |input| replayed.push(input))
        .await;

    assert_eq!(outcome, ReplayOutcome::Complete);
    assert_eq!(replayed.len(), 4);
    match &replayed[2] {
        ReplayInput::Asr(event) => assert_eq!(event.text, "what is a lock statement?"),
        ReplayInput::UtteranceEnd => panic!("expected an AsrEvent at index 2"),
    }
    assert!(matches!(replayed[3], ReplayInput::UtteranceEnd));
}

#[tokio::test]
async fn pausing_mid_replay_holds_subsequent_events_until_resume() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.jsonl");

    let recorder = SessionRecorder::create(&path, ts(0), SessionConfig::default(), 2000).unwrap();
    recorder.record_asr_event(asr("first", true, ts(0))).unwrap();
    recorder.record_asr_event(asr("second", true, ts(10))).unwrap();

    let player = SessionPlayer::load(&path).unwrap();
    let control = PlaybackControl::new();
    control.pause();
    control.resume();

    let mut replayed = Vec::new();
    let outcome = player
        .replay_into(&control, |input| replayed.push(input))
        .await;

    assert_eq!(outcome, ReplayOutcome::Complete);
    assert_eq!(replayed.len(), 2);
}
