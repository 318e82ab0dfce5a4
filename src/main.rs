use taintdiff::*;

use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::PathBuf;

use clap::Parser;

/// Cross-validate taint traces from a symbolic execution engine
#[derive(Parser, Debug)]
#[clap(about, version, author)]
enum Args {
    /// Summarize per-instruction taint from a satisfiability-query log
    ParseQueries {
        /// Path to the solver query log
        query_log: PathBuf,
        /// Path to write the taint summary to, instead of stdout
        #[clap(short, long)]
        output: Option<PathBuf>,
        /// Track 32 individual bits instead of 4 whole bytes
        #[clap(short, long)]
        bit_taint: bool,
        /// Echo disassembly and each query/result pair alongside the summary
        #[clap(short, long)]
        verbose: bool,
        /// Echo solver model text for each query
        #[clap(short, long)]
        model: bool,
        /// Byte offset to seek to before scanning
        #[clap(short, long)]
        seek: Option<u64>,
        /// Number of leading lines to discard
        #[clap(long)]
        skip_lines: Option<u64>,
        /// Stop after this many instruction groups
        #[clap(short, long)]
        count: Option<u64>,
        /// Abort on the first malformed solve result instead of skipping the
        /// affected instruction group
        #[clap(long)]
        strict: bool,
        #[clap(flatten)]
        logging: LoggingArgs,
    },
    /// Compare a simulation taint trace against a reference taint trace
    Compare {
        /// Path to the simulation-side taint trace
        sim_trace: PathBuf,
        /// Path to the reference-side taint trace
        ref_trace: PathBuf,
        /// Path to write the diff report to, instead of stdout
        #[clap(short, long)]
        output: Option<PathBuf>,
        /// Also report matching pairs, not only divergences
        #[clap(short, long)]
        verbose: bool,
        /// Compare entries whose simulation value is fully clean
        #[clap(long)]
        compare_clean: bool,
        /// Evict buffered reference entries older than this many instructions
        #[clap(long)]
        history_window: Option<u64>,
        #[clap(flatten)]
        logging: LoggingArgs,
    },
}

#[derive(clap::Args, Debug)]
struct LoggingArgs {
    /// Debug level (repeat for more: 0-warn, 1-info, 2-debug, 3-trace)
    #[clap(short, long, parse(from_occurrences))]
    debug: usize,
    /// Path to send log (as JSON) to
    ///
    /// Error or higher severity alerts will still continue being shown at
    /// stderr (in addition to being added to the log)
    #[clap(long = "--log")]
    log_file: Option<PathBuf>,
    /// Disable terminal logging, even for high severity alerts. Strongly
    /// discouraged for normal use.
    #[clap(long)]
    debug_disable_terminal_logging: bool,
}

impl LoggingArgs {
    fn install(&self) -> slog_scope::GlobalLoggerGuard {
        slog_scope::set_global_logger(log::FileAndTermDrain::new(
            self.debug,
            self.debug_disable_terminal_logging,
            self.log_file.clone(),
        ))
    }
}

fn output_sink(path: Option<PathBuf>) -> Box<dyn Write> {
    match path {
        Some(path) => Box::new(std::fs::File::create(path).expect("Output file could not be created")),
        None => Box::new(std::io::stdout()),
    }
}

fn main() {
    let args = Args::parse();

    match args {
        Args::ParseQueries {
            query_log,
            output,
            bit_taint,
            verbose,
            model,
            seek,
            skip_lines,
            count,
            strict,
            logging,
        } => {
            let _log_guard = logging.install();

            let mut file = std::fs::File::open(&query_log).expect("Query log could not be opened");
            if let Some(pos) = seek {
                // Seeking past the end is fine: the scanner just sees EOF.
                file.seek(SeekFrom::Start(pos)).expect("Seek failed");
            }
            let opts = scan::ScanOptions {
                width: if bit_taint {
                    taint::TaintWidth::Bitwise
                } else {
                    taint::TaintWidth::Bytewise
                },
                skip_lines: skip_lines.unwrap_or(0),
                max_records: count,
                echo_queries: verbose,
                echo_model: model,
            };
            let mut out = output_sink(output);

            for item in scan::QueryLogScanner::new(BufReader::new(file), opts) {
                match item {
                    Ok(record) => {
                        if verbose {
                            if let Some(disassembly) = &record.disassembly {
                                writeln!(out, "({}) {}", record.index, disassembly).unwrap();
                            }
                        }
                        for query in &record.queries {
                            if verbose {
                                writeln!(out, "{} -> {}", query.query, query.result).unwrap();
                            }
                            if let Some(model_text) = &query.model {
                                write!(out, "{}", model_text).unwrap();
                            }
                        }
                        for (key, value) in &record.taints {
                            writeln!(
                                out,
                                "  TAINT: ({}) {}  ->  {}",
                                record.index,
                                key,
                                value.to_hex()
                            )
                            .unwrap();
                        }
                    }
                    Err(e) => {
                        log::error!("Skipping instruction group"; "error" => %e);
                        if strict {
                            std::process::exit(1);
                        }
                    }
                }
            }

            log::trace!("Done");
        }
        Args::Compare {
            sim_trace,
            ref_trace,
            output,
            verbose,
            compare_clean,
            history_window,
            logging,
        } => {
            let _log_guard = logging.install();

            let sim = std::fs::File::open(&sim_trace).expect("Simulation trace could not be opened");
            let reference =
                std::fs::File::open(&ref_trace).expect("Reference trace could not be opened");
            let mut out = output_sink(output);

            let aligner = align::Aligner::new(
                BufReader::new(reference),
                align::AlignOptions {
                    verbose,
                    compare_clean,
                    history_window,
                }
            );
            let stats = aligner
                .run(BufReader::new(sim), &mut out)
                .expect("Trace comparison failed");

            log::info!(
                "Trace comparison finished";
                "compared" => stats.compared,
                "diverged" => stats.diverged,
                "skipped" => stats.skipped,
                "unmatched" => stats.unmatched,
                "evicted" => stats.evicted
            );
        }
    }
}
