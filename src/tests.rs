use crate::align::{AlignOptions, AlignStats, Aligner};
use crate::error::Error;
use crate::regmap;
use crate::scan::{QueryLogScanner, ScanOptions};
use crate::taint::{xor_popcount, InstructionTaintRecord, TaintValue, TaintWidth};

use itertools::Itertools;

fn sample_query_log() -> String {
    [
        "Reading trace header...",
        "**** 12 (0x08048000) ****",
        "mov (%esi), %eax",
        "--------",
        "// Query for taint [0] of R_EAX",
        "Model:",
        "INPUT_1000 -> 0x41",
        "Solve result: Invariant",
        "--------",
        "// Query for taint [1] of R_EAX",
        "Solve result: Variant.",
        "--------",
        "********",
        "**** 13 (0x08048002) ****",
        "add %eax, %ebx",
        "--------",
        "// Query for taint [0] of R_EBX",
        "Solve result: Variant.",
        "--------",
        "********",
    ]
    .join("\n")
}

fn scan_records(log: &str, opts: ScanOptions) -> Vec<InstructionTaintRecord> {
    QueryLogScanner::new(log.as_bytes(), opts)
        .map(|item| item.expect("record"))
        .collect()
}

fn run_align(sim: &str, reference: &str, opts: AlignOptions) -> (AlignStats, String) {
    let mut out = Vec::new();
    let stats = Aligner::new(reference.as_bytes(), opts)
        .run(sim.as_bytes(), &mut out)
        .expect("alignment run");
    (stats, String::from_utf8(out).expect("utf8 report"))
}

#[test]
fn canonical_hex_extremes() {
    assert_eq!(TaintValue::clean(TaintWidth::Bitwise).to_hex(), "0x00000000");
    assert_eq!(TaintValue::clean(TaintWidth::Bytewise).to_hex(), "0x00000000");

    let mut bits = TaintValue::clean(TaintWidth::Bitwise);
    for pos in 0..32 {
        bits.set(pos, true).unwrap();
    }
    assert_eq!(bits.to_hex(), "0xffffffff");

    let mut bytes = TaintValue::clean(TaintWidth::Bytewise);
    for pos in 0..4 {
        bytes.set(pos, true).unwrap();
    }
    assert_eq!(bytes.to_hex(), "0xFFFFFFFF");
}

#[test]
fn position_zero_is_least_significant() {
    let mut bits = TaintValue::clean(TaintWidth::Bitwise);
    bits.set(0, true).unwrap();
    assert_eq!(bits.to_hex(), "0x00000001");
    bits.set(0, false).unwrap();
    bits.set(31, true).unwrap();
    assert_eq!(bits.to_hex(), "0x80000000");

    let mut bytes = TaintValue::clean(TaintWidth::Bytewise);
    bytes.set(0, true).unwrap();
    assert_eq!(bytes.to_hex(), "0x000000FF");
    bytes.set(0, false).unwrap();
    bytes.set(3, true).unwrap();
    assert_eq!(bytes.to_hex(), "0xFF000000");
}

#[test]
fn positions_outside_width_are_rejected() {
    let mut bits = TaintValue::clean(TaintWidth::Bitwise);
    assert!(matches!(
        bits.set(32, true),
        Err(Error::PositionOutOfRange { pos: 32, .. })
    ));
    let mut bytes = TaintValue::clean(TaintWidth::Bytewise);
    assert!(matches!(
        bytes.set(4, true),
        Err(Error::PositionOutOfRange { pos: 4, .. })
    ));
    assert!(bytes.is_clean());
}

#[test]
fn xor_popcount_counts_differing_bits() {
    assert_eq!(xor_popcount("0x0000000f", "0x000000f0"), Some(8));
    assert_eq!(xor_popcount("0x000000FF", "0x000000FF"), Some(0));
    assert_eq!(xor_popcount("0x0000000f", "garbage"), None);
}

#[test]
fn scanner_emits_one_record_per_group() {
    let records = scan_records(&sample_query_log(), ScanOptions::default());
    assert_eq!(records.len(), 2);

    assert_eq!(records[0].index, 12);
    assert_eq!(records[0].disassembly.as_deref(), Some("mov (%esi), %eax"));
    assert_eq!(records[0].taints.len(), 1);
    assert_eq!(records[0].taints["R_EAX"].to_hex(), "0x000000FF");

    assert_eq!(records[1].index, 13);
    assert_eq!(records[1].taints["R_EBX"].to_hex(), "0x00000000");
}

#[test]
fn scanner_indices_are_non_decreasing() {
    let records = scan_records(&sample_query_log(), ScanOptions::default());
    assert!(records
        .iter()
        .map(|r| r.index)
        .tuple_windows()
        .all(|(a, b)| a <= b));
}

#[test]
fn scanning_is_deterministic() {
    let log = sample_query_log();
    let first = scan_records(&log, ScanOptions::default());
    let second = scan_records(&log, ScanOptions::default());
    assert_eq!(first, second);
}

#[test]
fn bitwise_scan_uses_bit_positions() {
    let opts = ScanOptions {
        width: TaintWidth::Bitwise,
        ..ScanOptions::default()
    };
    let records = scan_records(&sample_query_log(), opts);
    assert_eq!(records[0].taints["R_EAX"].to_hex(), "0x00000001");
}

#[test]
fn malformed_result_is_recoverable() {
    let log = sample_query_log().replace("Solve result: Invariant", "Solve result: Timeout");
    let items: Vec<_> = QueryLogScanner::new(log.as_bytes(), ScanOptions::default()).collect();
    assert_eq!(items.len(), 2);
    assert!(matches!(
        items[0],
        Err(Error::MalformedResult { line: 8, .. })
    ));
    // The scanner resynchronized and still emitted the second group.
    let record = items[1].as_ref().expect("second group");
    assert_eq!(record.index, 13);
}

#[test]
fn record_limit_caps_emission() {
    let opts = ScanOptions {
        max_records: Some(1),
        ..ScanOptions::default()
    };
    let records = scan_records(&sample_query_log(), opts);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].index, 12);
}

#[test]
fn leading_lines_can_be_skipped() {
    // Skip everything up to and including the first group's delimiter.
    let opts = ScanOptions {
        skip_lines: 13,
        ..ScanOptions::default()
    };
    let records = scan_records(&sample_query_log(), opts);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].index, 13);
}

#[test]
fn queries_are_echoed_on_request() {
    let opts = ScanOptions {
        echo_queries: true,
        echo_model: true,
        ..ScanOptions::default()
    };
    let records = scan_records(&sample_query_log(), opts);
    assert_eq!(records[0].queries.len(), 2);
    assert_eq!(
        records[0].queries[0].query,
        "// Query for taint [0] of R_EAX"
    );
    assert_eq!(records[0].queries[0].result, "Invariant");
    assert!(records[0].queries[0]
        .model
        .as_deref()
        .unwrap()
        .contains("INPUT_1000"));
    assert_eq!(records[0].queries[1].model, None);
}

#[test]
fn register_names_resolve_both_ways() {
    assert_eq!(regmap::resolve_reference("eax").as_deref(), Some("R_EAX"));
    assert_eq!(regmap::resolve_reference("ESP").as_deref(), Some("R_ESP"));
    assert_eq!(regmap::reference_name("R_EAX"), Some("eax"));
    assert_eq!(regmap::resolve_reference("not_a_register"), None);

    assert_eq!(regmap::resolve_simulation("R_EBX").as_deref(), Some("R_EBX"));
    assert_eq!(regmap::resolve_simulation("T_t32"), None);
}

#[test]
fn memory_operands_derive_the_same_key() {
    assert_eq!(
        regmap::resolve_simulation("mem:?u32[0x1000:u32, e_little]").as_deref(),
        Some("mem[0x1000]")
    );
    assert_eq!(
        regmap::resolve_reference("0x1000").as_deref(),
        Some("mem[0x1000]")
    );
    assert_eq!(
        regmap::resolve_reference("00001000").as_deref(),
        Some("mem[0x1000]")
    );
}

#[test]
fn aligned_streams_report_no_divergence() {
    let sim = "TAINT: (1) R_EAX:u32 @ 0x08048000 ->  0x000000FF\n\
               TAINT: (1) R_EBX:u32 @ 0x08048000 ->  0x0000FF00\n";
    let reference = "TAINT: (1) 08048000 : eax tw -> 0x000000FF (8)\n\
                     TAINT: (1) 08048000 : ebx tw -> 0x0000FF00 (8)\n";
    let (stats, report) = run_align(sim, reference, AlignOptions::default());
    assert_eq!(stats.compared, 2);
    assert_eq!(stats.diverged, 0);
    assert_eq!(stats.unmatched, 0);
    assert!(report.is_empty());
}

#[test]
fn out_of_order_reference_entries_are_buffered() {
    let sim = "TAINT: (1) R_EAX:u32 @ 0x08048000 ->  0x000000FF\n\
               TAINT: (1) R_EBX:u32 @ 0x08048000 ->  0x0000FF00\n\
               TAINT: (2) R_ECX:u32 @ 0x08048004 ->  0x00FF0000\n";
    // Same triples, different relative order.
    let reference = "TAINT: (2) 08048004 : ecx tw -> 0x00FF0000 (8)\n\
                     TAINT: (1) 08048000 : ebx tw -> 0x0000FF00 (8)\n\
                     TAINT: (1) 08048000 : eax tw -> 0x000000FF (8)\n";
    let (stats, report) = run_align(sim, reference, AlignOptions::default());
    assert_eq!(stats.compared, 3);
    assert_eq!(stats.diverged, 0);
    assert_eq!(stats.unmatched, 0);
    assert!(report.is_empty());
}

#[test]
fn divergences_report_xor_popcount() {
    let sim = "TAINT: (1) R_EAX:u32 @ 0x08048000 ->  0x0000000f\n";
    let reference = "TAINT: (1) 08048000 : eax tw -> 0x000000f0 (8)\n";
    let (stats, report) = run_align(sim, reference, AlignOptions::default());
    assert_eq!(stats.diverged, 1);
    assert_eq!(
        report.trim_end(),
        "(1) R_EAX : 0x0000000f <> 0x000000f0 XOR = 8"
    );
}

#[test]
fn verbose_mode_reports_matches() {
    let sim = "TAINT: (1) R_EAX:u32 @ 0x08048000 ->  0x000000FF\n";
    let reference = "TAINT: (1) 08048000 : eax tw -> 0x000000FF (8)\n";
    let opts = AlignOptions {
        verbose: true,
        ..AlignOptions::default()
    };
    let (stats, report) = run_align(sim, reference, opts);
    assert_eq!(stats.compared, 1);
    assert_eq!(report.trim_end(), "(1) R_EAX : 0x000000FF  ==  0x000000FF");
}

#[test]
fn memory_operands_align_by_derived_key() {
    let sim = "TAINT: (2) T_mem = mem:?u32[0x1000:u32, e_little]:u32 ->  0x000000FF\n";
    let reference = "TAINT: (2) 08048004 : 0x1000 mem -> 0x000000FF (8)\n";
    let (stats, report) = run_align(sim, reference, AlignOptions::default());
    assert_eq!(stats.compared, 1);
    assert_eq!(stats.diverged, 0);
    assert_eq!(stats.unmatched, 0);
    assert!(report.is_empty());
}

#[test]
fn clean_sentinel_skips_comparison_unless_requested() {
    let sim = "TAINT: (1) R_EAX:u32 @ 0x08048000 ->  0x00000000\n";
    let reference = "TAINT: (1) 08048000 : eax tw -> 0x000000FF (8)\n";

    let (stats, report) = run_align(sim, reference, AlignOptions::default());
    assert_eq!(stats.compared, 0);
    assert_eq!(stats.diverged, 0);
    assert!(report.is_empty());

    let opts = AlignOptions {
        compare_clean: true,
        ..AlignOptions::default()
    };
    let (stats, report) = run_align(sim, reference, opts);
    assert_eq!(stats.diverged, 1);
    assert!(report.contains("XOR = 8"));
}

#[test]
fn unresolved_simulation_entries_are_skipped_with_diagnostic() {
    let sim = "  TAINT: (3) T_t32:u32 tmp ->  0x00000001\n";
    let reference = "";
    let (stats, report) = run_align(sim, reference, AlignOptions::default());
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.compared, 0);
    assert!(report.starts_with("SKIPPED: "));
    assert!(report.contains("T_t32"));
}

#[test]
fn unmatched_entries_are_counted_not_fatal() {
    let sim = "TAINT: (5) R_EDX:u32 @ 0x08048008 ->  0x000000FF\n";
    let reference = "TAINT: (1) 08048000 : eax tw -> 0x000000FF (8)\n";
    let (stats, report) = run_align(sim, reference, AlignOptions::default());
    assert_eq!(stats.unmatched, 1);
    assert_eq!(stats.compared, 0);
    assert!(report.is_empty());
}

#[test]
fn retention_window_evicts_stale_entries() {
    let sim = "TAINT: (10) R_ECX:u32 @ 0x08048010 ->  0x000000FF\n\
               TAINT: (20) R_EDX:u32 @ 0x08048020 ->  0x000000FF\n";
    let reference = "TAINT: (1) 08048000 : eax tw -> 0x000000FF (8)\n\
                     TAINT: (2) 08048002 : ebx tw -> 0x0000FF00 (8)\n";
    let opts = AlignOptions {
        history_window: Some(5),
        ..AlignOptions::default()
    };
    let (stats, _) = run_align(sim, reference, opts);
    // Both buffered entries fell behind the second simulation index.
    assert_eq!(stats.evicted, 2);
    assert_eq!(stats.unmatched, 2);
}
