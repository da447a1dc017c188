use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use presence_core::{
    CorpusReader, DedupCoordinator, EmbeddingStore, Encoder, Encoding, FaceImage, LogOutcome,
    MatchResult, SnapshotCache,
};
use presence_io::{AttendanceFilter, CommandEncoder, Config, DirCorpus, SqliteLedger};
use std::io::Write;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "presence", about = "Presence attendance CLI")]
struct Cli {
    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the attendance database and its schema
    InitDb,
    /// Bring the local snapshot up to date with the corpus
    Recompute,
    /// Recompute if needed, then upload the snapshot to the remote store
    Publish,
    /// Encode identities missing from the remote snapshot and upload the union
    SyncRemote,
    /// Match one image against the current snapshot without logging
    Identify {
        /// Image file to identify
        image: PathBuf,
    },
    /// Log attendance for a person by name, honouring the dedup window
    Log {
        name: String,
        /// Event time (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Manage the roster
    #[command(subcommand)]
    Students(StudentCommands),
    /// Manage enrollment image records
    #[command(subcommand)]
    Images(ImageCommands),
    /// Add every corpus identity and image to the roster
    Enroll,
    /// Inspect and correct attendance records
    #[command(subcommand)]
    Attendance(AttendanceCommands),
    /// Show configuration, corpus and snapshot state
    Status,
}

#[derive(Subcommand)]
enum StudentCommands {
    /// Add a student
    Add {
        name: String,
        /// Free-form metadata (e.g. JSON)
        #[arg(long)]
        metadata: Option<String>,
    },
    /// List students
    List,
    /// Rename a student
    Rename { id: i64, name: String },
    /// Remove a student with their attendance and images
    Remove { id: i64 },
}

#[derive(Subcommand)]
enum ImageCommands {
    /// Register an image for a student
    Add { student_id: i64, image_url: String },
    /// List a student's images
    List { student_id: i64 },
}

#[derive(Subcommand)]
enum AttendanceCommands {
    /// List attendance records
    List {
        /// Only this student (by name)
        #[arg(long)]
        student: Option<String>,
        /// Earliest timestamp, RFC 3339
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        /// Latest timestamp, RFC 3339
        #[arg(long)]
        to: Option<DateTime<Utc>>,
    },
    /// Change a record's status (e.g. "excused")
    Status { id: i64, status: String },
    /// Delete a record
    Delete { id: i64 },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;
    let stdout = std::io::stdout();
    run(cli, &config, &mut stdout.lock())
}

fn open_store(config: &Config) -> Result<EmbeddingStore<DirCorpus, CommandEncoder>> {
    let mut store = EmbeddingStore::new(config.corpus(), config.encoder()?).with_cache(config.cache());
    if let Some(remote) = config.remote_store() {
        store = store.with_remote(remote);
    }
    Ok(store)
}

fn open_ledger(config: &Config) -> Result<SqliteLedger> {
    SqliteLedger::open(&config.db_path)
        .with_context(|| format!("opening ledger at {}", config.db_path.display()))
}

fn print_json(out: &mut impl Write, value: &impl serde::Serialize) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

fn run(cli: Cli, config: &Config, out: &mut impl Write) -> Result<()> {
    let json = cli.json;

    match cli.command {
        Commands::InitDb => {
            open_ledger(config)?;
            writeln!(out, "database ready at {}", config.db_path.display())?;
        }
        Commands::Recompute => {
            let mut store = open_store(config)?;
            let snapshot = store.refresh()?;
            writeln!(
                out,
                "snapshot {} (marker {}): {} identities, {} vectors",
                snapshot.id,
                snapshot.marker,
                snapshot.refs.len(),
                snapshot.refs.vector_count()
            )?;
        }
        Commands::Publish => {
            let mut store = open_store(config)?;
            store.refresh()?;
            let snapshot = store.publish()?;
            writeln!(out, "published snapshot {} ({} identities)", snapshot.id, snapshot.refs.len())?;
        }
        Commands::SyncRemote => {
            let mut store = open_store(config)?;
            let report = store.sync_remote()?;
            if report.uploaded {
                let added: Vec<&str> = report.added.iter().map(|i| i.as_str()).collect();
                writeln!(
                    out,
                    "uploaded snapshot {}: added {} ({}), {} already present",
                    report.snapshot.id,
                    added.len(),
                    added.join(", "),
                    report.already_present
                )?;
            } else {
                writeln!(
                    out,
                    "remote snapshot already covers all {} identities; nothing uploaded",
                    report.already_present
                )?;
            }
        }
        Commands::Identify { image } => {
            let mut store = open_store(config)?;
            let snapshot = store.refresh()?;
            let bytes = std::fs::read(&image).with_context(|| format!("reading {}", image.display()))?;
            let face = FaceImage::decode(image.display().to_string(), &bytes)?;
            match store.encoder_mut().encode(&face)? {
                Encoding::NoFace => writeln!(out, "no face")?,
                Encoding::Face(embedding) => {
                    match config.matcher_config().compare(&embedding, &snapshot.refs)? {
                        MatchResult::Identified { identity, distance } => {
                            writeln!(out, "{identity} (distance {distance:.4})")?
                        }
                        MatchResult::Unknown => writeln!(out, "unknown")?,
                    }
                }
            }
        }
        Commands::Log { name, at } => {
            let ledger = open_ledger(config)?;
            let mut dedup = DedupCoordinator::new(ledger, config.dedup_config());
            let at = at.unwrap_or_else(Utc::now);
            match dedup.log_presence(&name.as_str().into(), at)? {
                LogOutcome::Logged(id) => writeln!(out, "logged {name} at {} (record {id})", at.to_rfc3339())?,
                LogOutcome::Suppressed(_) => {
                    writeln!(out, "{name} already logged within the last {}s", config.window_secs)?
                }
            }
        }
        Commands::Students(cmd) => students(cmd, config, json, out)?,
        Commands::Images(cmd) => images(cmd, config, json, out)?,
        Commands::Enroll => {
            let entries = config.corpus().entries()?;
            let mut ledger = open_ledger(config)?;
            let report = ledger.enroll_entries(&entries)?;
            writeln!(
                out,
                "{} students created, {} images registered",
                report.students_created, report.images_added
            )?;
        }
        Commands::Attendance(cmd) => attendance(cmd, config, json, out)?,
        Commands::Status => status(config, json, out)?,
    }

    Ok(())
}

fn students(cmd: StudentCommands, config: &Config, json: bool, out: &mut impl Write) -> Result<()> {
    let ledger = open_ledger(config)?;
    match cmd {
        StudentCommands::Add { name, metadata } => {
            let id = ledger.create_student(&name, metadata.as_deref())?;
            writeln!(out, "added {name} (id {id})")?;
        }
        StudentCommands::List => {
            let list = ledger.list_students()?;
            if json {
                return print_json(out, &list);
            }
            if list.is_empty() {
                writeln!(out, "no students enrolled")?;
            }
            for s in list {
                writeln!(out, "{:>5}  {}", s.id, s.name)?;
            }
        }
        StudentCommands::Rename { id, name } => {
            if !ledger.update_student(id, Some(&name), None)? {
                bail!("no student with id {id}");
            }
            writeln!(out, "student {id} renamed to {name}")?;
        }
        StudentCommands::Remove { id } => {
            if !ledger.delete_student(id)? {
                bail!("no student with id {id}");
            }
            writeln!(out, "student {id} removed")?;
        }
    }
    Ok(())
}

fn images(cmd: ImageCommands, config: &Config, json: bool, out: &mut impl Write) -> Result<()> {
    let ledger = open_ledger(config)?;
    match cmd {
        ImageCommands::Add { student_id, image_url } => {
            if ledger.student(student_id)?.is_none() {
                bail!("no student with id {student_id}");
            }
            if ledger.add_student_image(student_id, &image_url)? {
                writeln!(out, "image registered for student {student_id}")?;
            } else {
                writeln!(out, "image already registered")?;
            }
        }
        ImageCommands::List { student_id } => {
            let list = ledger.student_images(student_id)?;
            if json {
                return print_json(out, &list);
            }
            for image in list {
                writeln!(out, "{:>5}  {}", image.id, image.image_url)?;
            }
        }
    }
    Ok(())
}

fn attendance(cmd: AttendanceCommands, config: &Config, json: bool, out: &mut impl Write) -> Result<()> {
    let ledger = open_ledger(config)?;
    match cmd {
        AttendanceCommands::List { student, from, to } => {
            let student_id = match student {
                Some(name) => match ledger.student_by_name(&name)? {
                    Some(s) => Some(s.id),
                    None => bail!("no student named {name}"),
                },
                None => None,
            };
            let records = ledger.attendance_records(&AttendanceFilter { student_id, from, to })?;
            if json {
                return print_json(out, &records);
            }
            for r in records {
                writeln!(out, "{:>5}  {}  {:<10}  {}", r.id, r.timestamp.to_rfc3339(), r.status, r.identity)?;
            }
        }
        AttendanceCommands::Status { id, status } => {
            if !ledger.update_attendance_status(id, &status)? {
                bail!("no attendance record {id}");
            }
            writeln!(out, "record {id} marked {status}")?;
        }
        AttendanceCommands::Delete { id } => {
            if !ledger.delete_attendance_record(id)? {
                bail!("no attendance record {id}");
            }
            writeln!(out, "record {id} deleted")?;
        }
    }
    Ok(())
}

#[derive(serde::Serialize)]
struct Status {
    corpus_dir: String,
    corpus_marker: Option<i64>,
    corpus_images: Option<usize>,
    cache_path: String,
    snapshot: Option<SnapshotStatus>,
    snapshot_fresh: Option<bool>,
    metric: String,
    tolerance: f32,
    window_secs: i64,
}

#[derive(serde::Serialize)]
struct SnapshotStatus {
    id: String,
    marker: i64,
    computed_at: String,
    identities: usize,
    vectors: usize,
}

fn status(config: &Config, json: bool, out: &mut impl Write) -> Result<()> {
    let corpus = config.corpus();
    let marker = match corpus.marker() {
        Ok(m) => Some(m),
        Err(e) => {
            tracing::warn!(error = %e, "corpus unreadable");
            None
        }
    };
    let images = corpus.entries().ok().map(|e| e.len());

    let snapshot = match config.cache().read() {
        Ok(Some(bytes)) => match presence_core::snapshot::decode(&bytes) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!(error = %e, "cached snapshot is corrupt");
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            tracing::warn!(error = %e, "snapshot cache unreadable");
            None
        }
    };

    let status = Status {
        corpus_dir: config.corpus_dir.display().to_string(),
        corpus_marker: marker.map(|m| m.as_millis()),
        corpus_images: images,
        cache_path: config.cache_path.display().to_string(),
        snapshot_fresh: match (&snapshot, marker) {
            (Some(s), Some(m)) => Some(s.is_fresh_for(m)),
            _ => None,
        },
        snapshot: snapshot.map(|s| SnapshotStatus {
            id: s.id.to_string(),
            marker: s.marker.as_millis(),
            computed_at: s.computed_at.to_rfc3339(),
            identities: s.refs.len(),
            vectors: s.refs.vector_count(),
        }),
        metric: config.metric.to_string(),
        tolerance: config.tolerance,
        window_secs: config.window_secs,
    };

    if json {
        return print_json(out, &status);
    }

    writeln!(out, "corpus:    {}", status.corpus_dir)?;
    match (status.corpus_marker, status.corpus_images) {
        (Some(m), Some(n)) => writeln!(out, "           {n} images, marker {m}")?,
        _ => writeln!(out, "           unreadable")?,
    }
    writeln!(out, "snapshot:  {}", status.cache_path)?;
    match &status.snapshot {
        Some(s) => writeln!(
            out,
            "           {} ({} identities, {} vectors, computed {}){}",
            s.id,
            s.identities,
            s.vectors,
            s.computed_at,
            if status.snapshot_fresh == Some(false) { " STALE" } else { "" }
        )?,
        None => writeln!(out, "           none")?,
    }
    writeln!(out, "matching:  {} <= {}", status.metric, status.tolerance)?;
    writeln!(out, "window:    {}s", status.window_secs)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::path::Path;

    fn png(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let img = RgbImage::from_pixel(2, 2, Rgb([200, 10, 10]));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    fn config(dir: &Path) -> Config {
        config_with(dir, &[])
    }

    fn config_with(dir: &Path, extra: &[(&str, &str)]) -> Config {
        Config::from_sources(dir, None, |key| match key {
            "PRESENCE_ENCODER_CMD" => Some(r#"sh -c "cat >/dev/null; echo '[0.6, 0.8]'""#.to_string()),
            _ => extra
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string()),
        })
        .unwrap()
    }

    fn exec(config: &Config, args: &[&str]) -> Result<String> {
        let cli = Cli::try_parse_from(std::iter::once("presence").chain(args.iter().copied()))?;
        let mut out = Vec::new();
        run(cli, config, &mut out)?;
        Ok(String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_student_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        exec(&config, &["init-db"]).unwrap();
        assert!(exec(&config, &["students", "add", "Ana"]).unwrap().contains("id 1"));
        exec(&config, &["students", "rename", "1", "Ana Lima"]).unwrap();
        assert!(exec(&config, &["students", "list"]).unwrap().contains("Ana Lima"));

        let listed: serde_json::Value =
            serde_json::from_str(&exec(&config, &["students", "list", "--json"]).unwrap()).unwrap();
        assert_eq!(listed[0]["name"], "Ana Lima");

        assert!(exec(&config, &["students", "remove", "7"]).is_err());
        exec(&config, &["students", "remove", "1"]).unwrap();
        assert!(exec(&config, &["students", "list"]).unwrap().contains("no students"));
    }

    #[test]
    fn test_log_respects_window() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        exec(&config, &["students", "add", "Ana"]).unwrap();

        let first = exec(&config, &["log", "Ana", "--at", "2024-06-10T08:00:00Z"]).unwrap();
        assert!(first.starts_with("logged Ana"));
        let second = exec(&config, &["log", "Ana", "--at", "2024-06-10T08:30:00Z"]).unwrap();
        assert!(second.contains("already logged"));
        let third = exec(&config, &["log", "Ana", "--at", "2024-06-10T09:00:01Z"]).unwrap();
        assert!(third.starts_with("logged Ana"));

        assert!(exec(&config, &["log", "Ghost"]).is_err());

        let records: serde_json::Value = serde_json::from_str(
            &exec(&config, &["attendance", "list", "--student", "Ana", "--json"]).unwrap(),
        )
        .unwrap();
        assert_eq!(records.as_array().unwrap().len(), 2);

        exec(&config, &["attendance", "status", "1", "excused"]).unwrap();
        exec(&config, &["attendance", "delete", "2"]).unwrap();
        assert!(exec(&config, &["attendance", "delete", "2"]).is_err());
        let listed = exec(&config, &["attendance", "list"]).unwrap();
        assert!(listed.contains("excused"));
    }

    #[test]
    fn test_enroll_recompute_identify() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        png(&config.corpus_dir.join("Ana/1.png"));
        png(&config.corpus_dir.join("Ana/2.png"));

        let enrolled = exec(&config, &["enroll"]).unwrap();
        assert!(enrolled.starts_with("1 students created, 2 images registered"));

        let recomputed = exec(&config, &["recompute"]).unwrap();
        assert!(recomputed.contains("1 identities, 2 vectors"));
        assert!(config.cache_path.is_file());

        let snap = dir.path().join("snap.png");
        png(&snap);
        let identified = exec(&config, &["identify", snap.to_str().unwrap()]).unwrap();
        assert!(identified.starts_with("Ana (distance 0.0000)"));

        let status: serde_json::Value =
            serde_json::from_str(&exec(&config, &["status", "--json"]).unwrap()).unwrap();
        assert_eq!(status["snapshot"]["identities"], 1);
        assert_eq!(status["snapshot_fresh"], true);
    }

    #[test]
    fn test_publish_requires_remote() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        png(&config.corpus_dir.join("Ana/1.png"));
        assert!(exec(&config, &["publish"]).is_err());
    }

    #[test]
    fn test_sync_remote_uploads_only_new_identities() {
        let dir = tempfile::tempdir().unwrap();
        let remote_dir = dir.path().join("shared");
        let config = config_with(dir.path(), &[("PRESENCE_REMOTE_DIR", remote_dir.to_str().unwrap())]);
        png(&config.corpus_dir.join("Ana/1.png"));

        let first = exec(&config, &["sync-remote"]).unwrap();
        assert!(first.contains("added 1 (Ana), 0 already present"), "{first}");
        let remote_file = remote_dir.join(&config.remote_key);
        let uploaded = std::fs::read(&remote_file).unwrap();

        let second = exec(&config, &["sync-remote"]).unwrap();
        assert!(second.contains("already covers all 1 identities"), "{second}");
        assert_eq!(std::fs::read(&remote_file).unwrap(), uploaded);

        png(&config.corpus_dir.join("Ben/1.png"));
        let third = exec(&config, &["sync-remote"]).unwrap();
        assert!(third.contains("added 1 (Ben), 1 already present"), "{third}");
    }

    #[test]
    fn test_sync_remote_requires_remote() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        png(&config.corpus_dir.join("Ana/1.png"));
        assert!(exec(&config, &["sync-remote"]).is_err());
    }

    #[test]
    fn test_image_records() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        exec(&config, &["students", "add", "Ana"]).unwrap();

        let added = exec(&config, &["images", "add", "1", "Ana/1.png"]).unwrap();
        assert!(added.contains("image registered for student 1"));
        let again = exec(&config, &["images", "add", "1", "Ana/1.png"]).unwrap();
        assert!(again.contains("already registered"));
        exec(&config, &["images", "add", "1", "Ana/2.png"]).unwrap();
        assert!(exec(&config, &["images", "add", "9", "Ghost/1.png"]).is_err());

        let listed = exec(&config, &["images", "list", "1"]).unwrap();
        assert!(listed.contains("Ana/1.png") && listed.contains("Ana/2.png"));
        let json: serde_json::Value =
            serde_json::from_str(&exec(&config, &["images", "list", "1", "--json"]).unwrap()).unwrap();
        assert_eq!(json.as_array().unwrap().len(), 2);
        assert_eq!(json[0]["image_url"], "Ana/1.png");
    }
}
