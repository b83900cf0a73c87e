//! Command-line front end for the graduation stand.
//!
//! Usage:
//!   graduator models                  list the gauge models in the catalog
//!   graduator monitor [seconds]       print transducer readings
//!   graduator run <model> [--both]    graduate a model on the simulated rig
//!   graduator history [session]       list archived parties
//!
//! Settings come from the saved settings file, then `GRADUATOR_*`
//! environment variables (a `.env` file is honored).

use std::env;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use graduator::{
    load, AngleFeed, CheckpointRequest, Decision, Direction, EngineError, GaugeCatalog,
    GaugeModel, GraduationEngine, GraduationTable, GraduatorSettings, PressureSensorChannel,
    PressureUnit, RigConfig, SerialSensorChannel, SessionJournal, SimulatedNeedle, SimulatedRig,
    SimulatedSensorChannel, StrokeMode,
};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const CAMERA_FRAME: Duration = Duration::from_millis(40);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut settings = GraduatorSettings::load();
    settings.apply_env();

    let args: Vec<String> = env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("models") => list_models(&settings),
        Some("monitor") => {
            let seconds = match args.get(2) {
                Some(s) => Some(s.parse::<u64>().context("monitor duration must be seconds")?),
                None => None,
            };
            monitor(&settings, seconds).await
        }
        Some("run") => {
            let name = args
                .get(2)
                .ok_or_else(|| anyhow!("usage: graduator run <model> [--both]"))?;
            let mode = if args[3..].iter().any(|a| a == "--both") {
                StrokeMode::ForwardAndBackward
            } else {
                settings.stroke_mode
            };
            run_simulated(&settings, name, mode).await
        }
        Some("history") => {
            let session = match args.get(2) {
                Some(s) => Some(s.parse::<Uuid>().context("session must be a UUID")?),
                None => None,
            };
            history(&settings, session)
        }
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn print_usage() {
    println!("Graduator - automatic pressure gauge graduation");
    println!();
    println!("Usage:");
    println!("  graduator models                  list the gauge models in the catalog");
    println!("  graduator monitor [seconds]       print transducer readings");
    println!("  graduator run <model> [--both]    graduate a model on the simulated rig");
    println!("  graduator history [session]       list archived parties");
    println!();
    println!("Environment:");
    println!("  GRADUATOR_SENSOR_PORT   serial port of the transducer");
    println!("  GRADUATOR_CATALOG_DIR   directory of gauge model files");
    println!("  GRADUATOR_STUB_SENSOR   1 to use the simulated transducer");
    println!("  RUST_LOG                log filter (default: info)");
}

fn list_models(settings: &GraduatorSettings) -> anyhow::Result<()> {
    let catalog = load(&settings.catalog_dir)
        .with_context(|| format!("Failed to load catalog from {}", settings.catalog_dir))?;

    println!("Catalog: {}", settings.catalog_dir);
    println!("================================================");
    for (i, model) in catalog.models.iter().enumerate() {
        let preload = settings
            .preload
            .preload_limit(model)
            .map(|l| format!("{:.2}", l))
            .unwrap_or_else(|| "not configured".to_string());
        println!(
            "{:>3}. {:<24} 0..{} {}  class {}  {} points  preload {}",
            i + 1,
            model.name(),
            model.upper_limit(),
            model.unit(),
            model.accuracy_class(),
            model.scale_points().len(),
            preload
        );
    }
    if catalog.skipped() > 0 {
        println!("({} file(s) skipped, see log)", catalog.skipped());
    }
    Ok(())
}

fn open_sensor(
    settings: &GraduatorSettings,
    rig: &SimulatedRig,
) -> anyhow::Result<Box<dyn PressureSensorChannel>> {
    let mut sensor: Box<dyn PressureSensorChannel> = if settings.stub_sensor {
        Box::new(SimulatedSensorChannel::new(
            rig.clone(),
            Duration::from_millis(settings.poll_interval_ms),
        ))
    } else {
        let protocol = settings.protocol().map_err(|e| anyhow!(e))?;
        Box::new(SerialSensorChannel::new(protocol, settings.polling_config()))
    };
    let port = if settings.stub_sensor {
        "SIM"
    } else {
        settings.sensor_port.as_str()
    };
    sensor.connect(port)?;
    sensor.start_polling()?;
    Ok(sensor)
}

async fn monitor(settings: &GraduatorSettings, seconds: Option<u64>) -> anyhow::Result<()> {
    let rig = SimulatedRig::new(RigConfig::default());
    let sensor = open_sensor(settings, &rig)?;
    let mut readings = sensor.subscribe();

    println!(
        "Monitoring {} (Ctrl-C to stop)",
        if sensor.is_stub() {
            "simulated transducer"
        } else {
            sensor.port().unwrap_or("unknown port")
        }
    );

    let deadline = tokio::time::sleep(Duration::from_secs(seconds.unwrap_or(u64::MAX / 4)));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            changed = readings.changed() => {
                if changed.is_err() {
                    break;
                }
                let sample = readings.borrow_and_update().clone();
                match sample {
                    Some(Ok(r)) => println!(
                        "{}  {:>10.4} {}  rate {:+.4}/s",
                        r.timestamp.format("%H:%M:%S%.3f"),
                        r.value,
                        r.unit,
                        r.rate
                    ),
                    Some(Err(e)) => println!("sensor error: {}", e),
                    None => {}
                }
            }
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

async fn run_simulated(
    settings: &GraduatorSettings,
    name: &str,
    mode: StrokeMode,
) -> anyhow::Result<()> {
    let (catalog, _) = GaugeCatalog::from_directory(&settings.catalog_dir)
        .with_context(|| format!("Failed to load catalog from {}", settings.catalog_dir))?;
    let model: Arc<GaugeModel> = catalog
        .find_by_name(name)
        .ok_or_else(|| anyhow!("No model named '{}' in {}", name, settings.catalog_dir))?;
    let unit = if settings.unit.trim().is_empty() {
        model.unit()
    } else {
        settings.unit.parse::<PressureUnit>()?
    };

    let rig = SimulatedRig::new(
        RigConfig::default()
            .with_unit(unit)
            .with_rate(model.unit().convert(model.upper_limit(), unit) / 20.0)
            .with_max_pressure(model.unit().convert(model.upper_limit(), unit) * 3.0),
    );
    let mut stub_settings = settings.clone();
    stub_settings.stub_sensor = true;
    let sensor = open_sensor(&stub_settings, &rig)?;
    let needle = Arc::new(SimulatedNeedle::new(rig.clone(), model.clone()));
    let frames = AngleFeed::new();
    let _camera = needle.spawn_camera(frames.clone(), CAMERA_FRAME);

    let mut engine = GraduationEngine::new(
        settings.engine_config(),
        sensor,
        Arc::new(frames),
        Arc::new(rig),
        settings.preload.clone(),
    )
    .with_journal(SessionJournal::persistent());
    if let Some(telemetry) = settings.telemetry_config() {
        engine = engine.with_telemetry(telemetry);
    }
    let checkpoints = engine
        .take_checkpoints()
        .ok_or_else(|| anyhow!("checkpoint channel already taken"))?;
    tokio::spawn(answer_checkpoints(checkpoints));

    let mut status = engine.handle().subscribe_status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let line = status.borrow_and_update().as_ref().map(|s| s.format_line());
            if let Some(line) = line {
                println!("📡 {}", line);
            }
        }
    });

    let handle = engine.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n🛑 Aborting");
            handle.abort();
        }
    });

    let id = engine.initialize(Some(model.clone()), Some(unit), mode)?;
    println!("Session {}: '{}' in {} ({:?})", id, model.name(), unit, mode);
    println!("================================================\n");

    let table = loop {
        match engine.run().await {
            Ok(table) => break table,
            Err(EngineError::Paused { reason }) => {
                println!("⏸️ Paused: {}. Press Enter to resume, or type 'quit'.", reason);
                if read_line().await?.trim() == "quit" {
                    engine.abort();
                    bail!("graduation abandoned");
                }
            }
            Err(e) => return Err(e.into()),
        }
    };

    println!("\n✅ Graduation complete");
    print_table(&table, &model);

    let table = review(table, &model).await?;
    let mut finished = engine
        .last_session()
        .cloned()
        .ok_or_else(|| anyhow!("finished session missing"))?;
    finished.table = table;

    if let Some(archive) = settings.result_archive() {
        let record = archive.save(&finished)?;
        println!("Saved as party {} in {}", record.party, record.dir.display());
    }
    if let Some(dir) = &finished.telemetry_dir {
        println!("Telemetry in {}", dir.display());
    }

    println!("\nJournal:");
    for entry in engine.journal().session_entries(id) {
        println!("  {}", entry.format_display());
    }
    Ok(())
}

fn print_table(table: &GraduationTable, model: &GaugeModel) {
    let mut index = (0, 0);
    for point in table.all_points() {
        let n = match point.direction {
            Direction::Forward => {
                index.0 += 1;
                index.0
            }
            Direction::Backward => {
                index.1 += 1;
                index.1
            }
        };
        println!(
            "  {}{:<3} target {:>9.3}  pressure {:>9.3}  angle {:>7.2}{}",
            if point.direction == Direction::Forward { 'f' } else { 'b' },
            n,
            point.target,
            point.pressure,
            point.angle,
            if point.accepted { "" } else { "  (rejected)" }
        );
    }

    let report = table.compute_nonlinearity(model);
    println!(
        "\nMax deviation {:.3}° (allowance {:.3}°), max hysteresis {:.3}°: {}",
        report.max_abs_deviation,
        report.allowance,
        report.max_hysteresis,
        if report.passed { "PASSED" } else { "FAILED" }
    );
}

/// Let the operator reject points before the result is archived.
async fn review(table: GraduationTable, model: &GaugeModel) -> anyhow::Result<GraduationTable> {
    loop {
        println!("\nReject points (e.g. 'f2 b1'), or press Enter to keep all.");
        let line = read_line().await?;
        if line.trim().is_empty() {
            return Ok(table);
        }
        let reviewed = parse_rejections(&line).and_then(|r| Ok(table.review(&r)?));
        match reviewed {
            Ok(reviewed) => {
                print_table(&reviewed, model);
                return Ok(reviewed);
            }
            Err(e) => println!("❌ {}", e),
        }
    }
}

/// Parse `f<n>`/`b<n>` point references, numbered from 1 per direction.
fn parse_rejections(input: &str) -> anyhow::Result<Vec<(Direction, usize)>> {
    input
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
        .map(|token| {
            let token = token.to_ascii_lowercase();
            let mut chars = token.chars();
            let direction = match chars.next() {
                Some('f') => Direction::Forward,
                Some('b') => Direction::Backward,
                _ => bail!("'{}' is not f<n> or b<n>", token),
            };
            match chars.as_str().parse::<usize>() {
                Ok(n) if n > 0 => Ok((direction, n - 1)),
                _ => bail!("'{}' needs a point number from 1", token),
            }
        })
        .collect()
}

fn history(settings: &GraduatorSettings, session: Option<Uuid>) -> anyhow::Result<()> {
    let archive = settings
        .result_archive()
        .ok_or_else(|| anyhow!("Cannot determine the archive directory"))?;
    let records = match session {
        Some(id) => archive.find(id)?.into_iter().collect(),
        None => archive.history()?,
    };
    if records.is_empty() {
        println!("No archived parties");
    }
    for record in records {
        println!(
            "{}  p{:<3} {:<20} {:>2} points ({} rejected)  {:>6.1}s  max dev {:.3}°  {}  {}",
            record.finished_at.format("%d.%m.%Y %H:%M"),
            record.party,
            record.model,
            record.points,
            record.rejected,
            record.duration_s,
            record.max_abs_deviation,
            if record.passed { "PASSED" } else { "FAILED" },
            record.session
        );
    }
    Ok(())
}

async fn answer_checkpoints(mut checkpoints: mpsc::Receiver<CheckpointRequest>) {
    while let Some(request) = checkpoints.recv().await {
        println!("\n⚠️ {}", request.anomaly);
        println!("Continue? [y/N]");
        let decision = match read_line().await {
            Ok(line) if matches!(line.trim().to_lowercase().as_str(), "y" | "yes") => {
                Decision::Continue
            }
            _ => Decision::Cancel,
        };
        request.resolve(decision);
    }
}

async fn read_line() -> anyhow::Result<String> {
    tokio::task::spawn_blocking(|| {
        print!("> ");
        io::stdout().flush()?;
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        Ok::<_, io::Error>(line)
    })
    .await?
    .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejections() {
        assert_eq!(
            parse_rejections("f2 B1,f3").unwrap(),
            vec![
                (Direction::Forward, 1),
                (Direction::Backward, 0),
                (Direction::Forward, 2)
            ]
        );
        assert!(parse_rejections("").unwrap().is_empty());
        assert!(parse_rejections("f0").is_err());
        assert!(parse_rejections("x2").is_err());
        assert!(parse_rejections("fb").is_err());
    }
}
