// Attempt-plan shapes for the cases the whitelists exist for

use ffbatch::engine::{Codec, DecodeMode, DetectedEncoders, Encoder, build_attempt_plan};

#[test]
fn wmv3_plan_differs_per_encoder_whitelist() {
    let detected =
        DetectedEncoders::from_available(vec![Encoder::Nvenc, Encoder::Qsv, Encoder::Cpu]);
    let plan = build_attempt_plan(&detected, "wmv3", Codec::Hevc);

    // NVENC cannot hardware-decode wmv3: its chain starts at limited
    // software decode.
    let nvenc_modes: Vec<DecodeMode> = plan
        .iter()
        .filter(|s| s.encoder == Encoder::Nvenc)
        .map(|s| s.decode_mode)
        .collect();
    assert_eq!(
        nvenc_modes,
        vec![DecodeMode::SwDecodeLimited, DecodeMode::SwDecode]
    );

    // QSV can: its chain starts at hardware decode.
    let qsv_modes: Vec<DecodeMode> = plan
        .iter()
        .filter(|s| s.encoder == Encoder::Qsv)
        .map(|s| s.decode_mode)
        .collect();
    assert_eq!(
        qsv_modes,
        vec![
            DecodeMode::HwDecode,
            DecodeMode::SwDecodeLimited,
            DecodeMode::SwDecode
        ]
    );
}

#[test]
fn encoder_priority_order_is_stable() {
    let detected = DetectedEncoders::from_available(vec![
        Encoder::Nvenc,
        Encoder::Qsv,
        Encoder::Videotoolbox,
        Encoder::Cpu,
    ]);
    let plan = build_attempt_plan(&detected, "h264", Codec::Hevc);

    let mut order: Vec<Encoder> = Vec::new();
    for spec in &plan {
        if order.last() != Some(&spec.encoder) {
            order.push(spec.encoder);
        }
    }
    assert_eq!(
        order,
        vec![
            Encoder::Nvenc,
            Encoder::Qsv,
            Encoder::Videotoolbox,
            Encoder::Cpu
        ]
    );
}

#[test]
fn compat_tail_is_avc_on_cpu_only_for_non_avc_targets() {
    let detected = DetectedEncoders::from_available(vec![Encoder::Cpu]);

    let hevc = build_attempt_plan(&detected, "h264", Codec::Hevc);
    assert_eq!(
        hevc.last().map(|s| (s.encoder, s.codec)),
        Some((Encoder::Cpu, Codec::Avc))
    );

    let avc = build_attempt_plan(&detected, "h264", Codec::Avc);
    assert!(avc.iter().all(|s| s.codec == Codec::Avc));
    assert_eq!(avc.len(), 2);
}

#[test]
fn disabled_hardware_leaves_cpu_only_plan() {
    let detected = DetectedEncoders::from_available(vec![Encoder::Cpu]);
    let plan = build_attempt_plan(&detected, "prores", Codec::Hevc);
    assert!(plan.iter().all(|s| s.encoder == Encoder::Cpu));
    assert!(plan.iter().all(|s| s.decode_mode != DecodeMode::HwDecode));
}
