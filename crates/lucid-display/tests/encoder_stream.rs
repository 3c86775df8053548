//! End-to-end encoder scenarios against a real libx264.

use std::sync::mpsc;
use std::time::Duration;

use lucid_display::{DisplayEncoder, DisplayPartialBitmap, DisplayStreamConfig};

const WIDTH: u32 = 64;
const HEIGHT: u32 = 48;
const STRIDE: usize = WIDTH as usize * 4;

fn small_encoder() -> DisplayEncoder {
    DisplayEncoder::new(WIDTH, HEIGHT, 32, STRIDE, &DisplayStreamConfig::default())
}

/// Splits an Annex-B byte stream into NAL unit types.
fn nal_types(payload: &[u8]) -> Vec<u8> {
    let mut types = Vec::new();
    let mut i = 0;
    while i + 3 < payload.len() {
        if payload[i] == 0 && payload[i + 1] == 0 {
            let (skip, hit) = if payload[i + 2] == 1 {
                (3, true)
            } else if i + 4 <= payload.len() && payload[i + 2] == 0 && payload[i + 3] == 1 {
                (4, true)
            } else {
                (1, false)
            };
            if hit {
                if let Some(&header) = payload.get(i + skip) {
                    types.push(header & 0x1F);
                }
                i += skip + 1;
                continue;
            }
        }
        i += 1;
    }
    types
}

#[test]
fn start_forces_a_keyframe_covering_the_viewport() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let encoder = small_encoder();
    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    encoder.start(Box::new(move |payload| {
        let _ = tx.send(payload.to_vec());
    }));

    // No render needed: start alone queues the full-screen slice and the
    // worker picks it up within one idle tick.
    let first = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("no frame within one wake cycle");

    let types = nal_types(&first);
    assert!(
        types.contains(&5),
        "first sequence carries no IDR: {types:?}"
    );

    encoder.stop();
}

#[test]
fn render_produces_frames_and_stop_silences_the_callback() {
    let encoder = small_encoder();
    let (tx, rx) = mpsc::channel::<usize>();
    encoder.start(Box::new(move |payload| {
        let _ = tx.send(payload.len());
    }));

    let pixels = vec![0x80u8; STRIDE * HEIGHT as usize];
    encoder.render(&[DisplayPartialBitmap {
        x: 0,
        y: 0,
        width: WIDTH,
        height: HEIGHT,
        stride: STRIDE,
        flip: false,
        segments: vec![&pixels],
    }]);

    let size = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("no frame after render");
    assert!(size > 0);

    encoder.stop();
    // Drain anything emitted before stop took the lock, then verify
    // silence: nothing new may arrive after stop has returned.
    while rx.try_recv().is_ok() {}
    assert!(rx.recv_timeout(Duration::from_millis(1200)).is_err());
}

#[test]
fn force_keyframe_reissues_an_idr_mid_stream() {
    let encoder = small_encoder();
    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    encoder.start(Box::new(move |payload| {
        let _ = tx.send(payload.to_vec());
    }));

    // First frame: the forced start keyframe.
    let _ = rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // A couple of ordinary delta ticks.
    let pixels = vec![0x20u8; STRIDE * HEIGHT as usize];
    encoder.render(&[DisplayPartialBitmap {
        x: 0,
        y: 0,
        width: WIDTH,
        height: HEIGHT,
        stride: STRIDE,
        flip: false,
        segments: vec![&pixels],
    }]);
    let _ = rx.recv_timeout(Duration::from_secs(5)).unwrap();

    encoder.force_keyframe();
    // The worker also ticks on its idle timer, so a pre-force delta frame
    // may still be in flight; the IDR must show up within a few frames.
    let mut found = false;
    for _ in 0..10 {
        let Ok(frame) = rx.recv_timeout(Duration::from_secs(5)) else {
            break;
        };
        if nal_types(&frame).contains(&5) {
            found = true;
            break;
        }
    }
    assert!(found, "no IDR within ten frames of force_keyframe");

    encoder.stop();
}

#[test]
fn render_while_stopped_only_updates_the_bitmap() {
    let encoder = small_encoder();
    let pixels = vec![0xFFu8; STRIDE * HEIGHT as usize];
    // Never started: must not panic, must not encode.
    encoder.render(&[DisplayPartialBitmap {
        x: 0,
        y: 0,
        width: WIDTH,
        height: HEIGHT,
        stride: STRIDE,
        flip: false,
        segments: vec![&pixels],
    }]);
}

#[test]
fn drop_joins_the_worker() {
    let encoder = small_encoder();
    encoder.start(Box::new(|_| {}));
    drop(encoder);
}
