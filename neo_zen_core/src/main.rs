// Neo Zen generator: CLI entry point.
//
// Builds a generation run from a settings file (or defaults), drives the
// reference voices through the governance core and writes the accepted
// notes to MIDI.
//
// Usage:
//   cargo run -p neo_zen_core --bin generate -- [output.mid] [--settings FILE]
//     [--seed N] [--duration SECONDS] [--tempo BPM]

use neo_zen_core::midi::{MidiExport, write_midi};
use neo_zen_core::session::GenerationRun;
use neo_zen_core::settings::Settings;
use neo_zen_core::voice::Voice;
use neo_zen_core::voices::reference_voices;
use std::path::Path;

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let output_path = args
        .get(1)
        .filter(|s| !s.starts_with("--"))
        .map(|s| s.as_str())
        .unwrap_or("output.mid");

    let mut settings = match parse_flag::<String>(&args, "--settings") {
        Some(path) => match load_settings(Path::new(&path)) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("Failed to load settings from {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => Settings::default(),
    };
    if let Some(seed) = parse_flag(&args, "--seed") {
        settings.seed = seed;
    }
    if let Some(duration) = parse_flag(&args, "--duration") {
        settings.total_duration_seconds = duration;
    }
    if let Some(tempo) = parse_flag(&args, "--tempo") {
        settings.base_tempo = tempo;
    }

    let mut run = match GenerationRun::new(&settings) {
        Ok(run) => run,
        Err(e) => {
            eprintln!("Cannot build timeline: {}", e);
            std::process::exit(1);
        }
    };
    let s = run.settings().clone();
    let plan = run.plan().clone();

    println!("=== Neo Zen Generator ===");
    println!("Output: {}", output_path);
    println!("Key: {} {}", s.key, s.scale);
    println!("Tuning: {} (drone note {})", plan.mode.name(), plan.primary_drone_note());
    println!("Tempo: {} BPM, duration {:.0}s", s.base_tempo, s.total_duration_seconds);
    println!("Seed: {}", s.seed);
    println!();

    println!("[1/3] Timeline: {} segments over {} ticks", run.segments().len(), run.total_ticks());
    for seg in run.segments().iter().take(8) {
        println!(
            "  {:>6}-{:<6} {:<8} {:<11} energy {:.2}",
            seg.start_tick,
            seg.end_tick,
            seg.chord_symbol,
            seg.phase_name.name(),
            seg.energy_bias
        );
    }
    if run.segments().len() > 8 {
        println!("  ...");
    }

    println!("[2/3] Generating voices...");
    let mut generators = reference_voices(&s.voices);
    let total = run.generate(&mut generators).len();
    for voice in Voice::GENERATION_ORDER {
        let st = run.stats(voice);
        if st.requested == 0 {
            continue;
        }
        println!(
            "  {:<8} requested {:>5}  admitted {:>5}  emitted {:>5}  refused {:>4}",
            voice.name(),
            st.requested,
            st.admitted,
            st.emitted,
            st.refused
        );
    }
    println!("  {} notes accepted.", total);

    println!("[3/3] Writing MIDI to {}...", output_path);
    let export = MidiExport {
        ppq: s.ppq,
        tempo_bpm: s.base_tempo,
        transpose: plan.global_shift(),
    };
    if let Err(e) = write_midi(run.events(), &export, Path::new(output_path)) {
        eprintln!("  Error writing MIDI: {}", e);
        std::process::exit(1);
    }
    println!("  Done!");
}

fn load_settings(path: &Path) -> Result<Settings, Box<dyn std::error::Error>> {
    let json = std::fs::read_to_string(path)?;
    Ok(Settings::from_json(&json)?)
}

fn parse_flag<T: std::str::FromStr>(args: &[String], flag: &str) -> Option<T> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|v| v.parse().ok())
}
