use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use clap::{Parser, Subcommand};
use rollcall_engine::{
    rebuild_gallery, DateRange, EnrollError, Enroller, Frame, FrameProcessor, GalleryIndex, Granularity, Ledger,
    Photo, Pipeline, Recipient, ReportAggregator, SessionId, SessionRecorder, SharedGallery, StudentId,
};
use rollcall_vision::{ArcFaceEncoder, FaceDetector, FaceEncoder, ScrfdDetector};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance ledger")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a student from one or more reference photos
    Enroll {
        /// Display name of the student
        #[arg(short, long)]
        name: String,
        /// Photos, each showing exactly one face
        #[arg(required = true)]
        photos: Vec<PathBuf>,
    },
    /// Add reference photos to an enrolled student
    AddPhotos {
        #[arg(short, long)]
        student: i64,
        #[arg(required = true)]
        photos: Vec<PathBuf>,
    },
    /// List registered students
    Students,
    /// Retire a student; their history is kept
    Retire { student: i64 },
    /// Open, close or list class sessions
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Feed image files of a session through the recognition pipeline
    Ingest {
        #[arg(short, long)]
        session: SessionId,
        /// Camera name recorded in frame references
        #[arg(long, default_value = "cam0")]
        source: String,
        /// Capture time of the first frame (RFC 3339); defaults to now
        #[arg(long)]
        start: Option<DateTime<Utc>>,
        /// Capture interval between consecutive frames
        #[arg(long, default_value_t = 1000)]
        interval_ms: i64,
        /// Submit without waiting for queue space (older frames may be dropped)
        #[arg(long)]
        live: bool,
        #[arg(required = true)]
        frames: Vec<PathBuf>,
    },
    /// Students confirmed in a session
    Roster { session: SessionId },
    /// Active students missing from a session
    Absentees { session: SessionId },
    /// Per-session attendance of a student
    History {
        student: i64,
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Daily or monthly present/absent counts of a student
    Series {
        student: i64,
        #[arg(short, long, default_value = "daily")]
        granularity: Granularity,
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Attendance summary for a parent or management report
    Summary {
        student: i64,
        #[arg(short, long, default_value = "parent")]
        recipient: Recipient,
        #[command(flatten)]
        range: RangeArgs,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Start monitoring a class
    Open {
        #[arg(short, long)]
        course: String,
    },
    /// Stop monitoring a class
    Close { session: SessionId },
    /// List sessions still open
    List,
    /// Close sessions open longer than the configured timeout
    Sweep,
}

#[derive(clap::Args)]
struct RangeArgs {
    /// First day included (YYYY-MM-DD, UTC)
    #[arg(long)]
    from: Option<NaiveDate>,
    /// Last day included (YYYY-MM-DD, UTC)
    #[arg(long)]
    to: Option<NaiveDate>,
}

impl RangeArgs {
    fn range(&self) -> Result<DateRange> {
        let all = DateRange::all();
        let start = self.from.map_or(all.start, midnight);
        let end = match self.to {
            Some(day) => midnight(day.succ_opt().context("--to is out of range")?),
            None => all.end,
        };
        if start >= end {
            bail!("empty date range");
        }
        Ok(DateRange::new(start, end))
    }
}

fn midnight(day: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&day.and_time(NaiveTime::MIN))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;
    tracing::debug!(?config, "configuration loaded");

    match cli.command {
        Commands::Enroll { name, photos } => {
            let enroller = enroller(&config)?;
            match enroller.enroll(&name, &read_photos(&photos)?) {
                Ok(report) => print_json(&report)?,
                Err(EnrollError::NoUsablePhoto(count, rejected)) => {
                    print_json(&rejected)?;
                    bail!("none of the {count} photos could be used; nothing was stored");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Commands::AddPhotos { student, photos } => {
            let enroller = enroller(&config)?;
            print_json(&enroller.add_photos(StudentId(student), &read_photos(&photos)?)?)?;
        }
        Commands::Students => {
            print_json(&open_ledger(&config)?.students()?)?;
        }
        Commands::Retire { student } => {
            open_ledger(&config)?.retire_student(StudentId(student))?;
            println!("retired student {student}");
        }
        Commands::Session { action } => session_command(&config, action)?,
        Commands::Ingest {
            session,
            source,
            start,
            interval_ms,
            live,
            frames,
        } => {
            let config = config.clone();
            let options = IngestOptions {
                session,
                source,
                start: start.unwrap_or_else(Utc::now),
                interval: Duration::milliseconds(interval_ms),
                live,
            };
            tokio::task::spawn_blocking(move || ingest(&config, options, &frames)).await??;
        }
        Commands::Roster { session } => {
            print_json(&reports(&config)?.session_roster(session)?)?;
        }
        Commands::Absentees { session } => {
            print_json(&reports(&config)?.session_absentees(session)?)?;
        }
        Commands::History { student, range } => {
            print_json(&reports(&config)?.student_history(StudentId(student), range.range()?)?)?;
        }
        Commands::Series {
            student,
            granularity,
            range,
        } => {
            let series = reports(&config)?.attendance_series(StudentId(student), range.range()?, granularity)?;
            print_json(&series)?;
        }
        Commands::Summary {
            student,
            recipient,
            range,
        } => {
            let summary = reports(&config)?.student_summary(StudentId(student), range.range()?, recipient)?;
            print_json(&summary)?;
        }
    }

    Ok(())
}

fn session_command(config: &Config, action: SessionAction) -> Result<()> {
    let ledger = open_ledger(config)?;
    match action {
        SessionAction::Open { course } => print_json(&ledger.open_session(&course, Utc::now())?),
        SessionAction::Close { session } => print_json(&ledger.close_session(session, Utc::now())?),
        SessionAction::List => print_json(&ledger.open_sessions()?),
        SessionAction::Sweep => {
            let Some(timeout) = config.session_timeout() else {
                bail!("session timeout is disabled");
            };
            let now = Utc::now();
            print_json(&ledger.close_stale_sessions(now - timeout, now)?)
        }
    }
}

struct IngestOptions {
    session: SessionId,
    source: String,
    start: DateTime<Utc>,
    interval: Duration,
    live: bool,
}

#[derive(Serialize)]
struct IngestReport {
    stats: rollcall_engine::PipelineStats,
    events: Vec<rollcall_engine::AttendanceEvent>,
}

fn ingest(config: &Config, options: IngestOptions, frames: &[PathBuf]) -> Result<()> {
    let ledger = Arc::new(open_ledger(config)?);
    match ledger.session(options.session)? {
        Some(session) if session.ended_at.is_none() => {}
        Some(_) => bail!("session {} is closed", options.session),
        None => bail!("unknown session {}", options.session),
    }

    let (detector, encoder) = load_backends(config)?;
    let gallery = open_gallery(&ledger, encoder.as_ref())?;
    let processor = Arc::new(FrameProcessor::new(detector, encoder, gallery, config.max_distance));
    let recorder = SessionRecorder::new(ledger.clone(), config.dedup()).with_session_timeout(config.session_timeout());
    let pipeline = Pipeline::spawn(processor, recorder, config.pipeline())?;

    let pipeline_config = config.pipeline();
    for (index, path) in frames.iter().enumerate() {
        let data = std::fs::read(path).with_context(|| format!("reading frame {}", path.display()))?;
        if !options.live {
            while pipeline.queued() >= pipeline_config.queue_capacity {
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
        }
        let frame = Frame {
            source: options.source.clone(),
            sequence: index as u64,
            captured_at: options.start + options.interval * index as i32,
            data,
        };
        pipeline.submit(options.session, frame)?;
    }

    let stats = pipeline.shutdown()?;
    let events = ledger.events_for_session(options.session)?;
    print_json(&IngestReport { stats, events })
}

fn open_ledger(config: &Config) -> Result<Ledger> {
    Ledger::open(&config.db_path, config.ledger_options())
        .with_context(|| format!("opening ledger {}", config.db_path.display()))
}

fn reports(config: &Config) -> Result<ReportAggregator> {
    Ok(ReportAggregator::new(Arc::new(open_ledger(config)?)))
}

fn load_backends(config: &Config) -> Result<(Arc<dyn FaceDetector>, Arc<dyn FaceEncoder>)> {
    let detector_path = config.detector_model_path();
    let detector = ScrfdDetector::load(&detector_path)
        .with_context(|| format!("loading detection model {}", detector_path.display()))?;
    tracing::info!(path = %detector_path.display(), "SCRFD detector loaded");

    let recognizer_path = config.recognizer_model_path();
    let encoder = ArcFaceEncoder::load(&recognizer_path, config.metric)
        .with_context(|| format!("loading recognition model {}", recognizer_path.display()))?;
    tracing::info!(path = %recognizer_path.display(), "ArcFace encoder loaded");

    Ok((Arc::new(detector), Arc::new(encoder)))
}

fn open_gallery(ledger: &Ledger, encoder: &dyn FaceEncoder) -> Result<SharedGallery> {
    let gallery = GalleryIndex::new(encoder.model_version(), encoder.metric()).shared();
    rebuild_gallery(ledger, &gallery).context("loading gallery from ledger")?;
    Ok(gallery)
}

fn enroller(config: &Config) -> Result<Enroller> {
    let ledger = Arc::new(open_ledger(config)?);
    let (detector, encoder) = load_backends(config)?;
    let gallery = open_gallery(&ledger, encoder.as_ref())?;
    Ok(Enroller::new(detector, encoder, ledger, gallery))
}

fn read_photos(paths: &[PathBuf]) -> Result<Vec<Photo>> {
    paths.iter().map(|path| read_photo(path)).collect()
}

fn read_photo(path: &Path) -> Result<Photo> {
    let data = std::fs::read(path).with_context(|| format!("reading photo {}", path.display()))?;
    Ok(Photo {
        label: path.display().to_string(),
        data,
    })
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
