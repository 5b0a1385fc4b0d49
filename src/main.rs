use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use snafu::Report;
use tracing::{error, info};

use dicom_upload::error::Error;
use dicom_upload::logging::{self, LOG_FILE_NAME};
use dicom_upload::patient_map::PatientIdMap;
use dicom_upload::repository::http::HttpRepository;
use dicom_upload::repository::services;
use dicom_upload::settings::{Settings, Transport};
use dicom_upload::upload::{BatchDriver, Uploader};

/// Upload DICOM files into a project of a remote asset repository,
/// skipping instances that are already stored
#[derive(Debug, Parser)]
#[command(name = "dicom-upload", version)]
struct Cli {
    /// the DICOM files or directories to upload
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// settings file [default: ~/.dicom-upload/settings.toml]
    #[arg(long)]
    config: Option<PathBuf>,
    /// repository host
    #[arg(long)]
    host: Option<String>,
    /// repository port [default: 443 for https, 80 for http]
    #[arg(long)]
    port: Option<u16>,
    /// http or https
    #[arg(long)]
    transport: Option<Transport>,
    /// authenticate as domain,user,password
    #[arg(long)]
    auth: Option<String>,
    /// authenticate with a secure identity token
    #[arg(long)]
    token: Option<String>,
    /// reuse an existing session
    #[arg(long)]
    sid: Option<String>,
    /// project cid to upload into
    #[arg(long)]
    pid: Option<String>,
    /// file mapping patient ids to accession numbers
    #[arg(long)]
    patient_id_map: Option<PathBuf>,
    /// gzip compression level of upload archives (0-9) [default: 6]
    #[arg(long)]
    compression_level: Option<u32>,
    /// keep going when a file fails
    #[arg(long)]
    continue_on_error: bool,
    /// compare pixel data checksums of already stored instances
    #[arg(long)]
    csum: bool,
    /// verbose mode
    #[arg(short, long)]
    verbose: bool,
    /// also write the log to ./dicom-upload.log
    #[arg(long)]
    logging: bool,
}

impl Cli {
    fn apply(&self, settings: &mut Settings) {
        let connection = &mut settings.connection;
        if let Some(host) = &self.host {
            connection.host = Some(host.clone());
        }
        if let Some(port) = self.port {
            connection.port = Some(port);
        }
        if let Some(transport) = self.transport {
            connection.transport = transport;
        }
        if self.auth.is_some() || self.token.is_some() || self.sid.is_some() {
            connection.auth = self.auth.clone();
            connection.token = self.token.clone();
            connection.sid = self.sid.clone();
        }

        let upload = &mut settings.upload;
        if let Some(pid) = &self.pid {
            upload.project = Some(pid.clone());
        }
        if let Some(map) = &self.patient_id_map {
            upload.patient_id_map = Some(map.clone());
        }
        if let Some(level) = self.compression_level {
            upload.compression_level = level;
        }
        upload.continue_on_error |= self.continue_on_error;
        upload.csum |= self.csum;
        settings.verbose |= self.verbose;
        settings.logging |= self.logging;
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e.exit_code();
            if tracing::dispatcher::has_been_set() {
                error!("{}", Report::from_error(e));
            } else {
                eprintln!("{}", Report::from_error(e));
            }
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> Result<(), Error> {
    let mut settings = Settings::load(cli.config.as_deref())?;
    cli.apply(&mut settings);
    let settings = settings.resolve()?;
    if let Some(missing) = cli.inputs.iter().find(|p| !p.exists()) {
        return Err(Error::InvalidSettings {
            message: format!("input {} does not exist", missing.display()),
        });
    }

    logging::init(
        settings.verbose,
        settings.logging.then(|| Path::new(LOG_FILE_NAME)),
    )?;
    let patient_ids = PatientIdMap::load(&settings.patient_id_map)?;

    let repository = HttpRepository::connect(&settings.connection)
        .await
        .map_err(|source| Error::Repository {
            service: services::LOGON.to_string(),
            source,
        })?;
    info!(
        "Uploading into {} at {}",
        settings.project,
        settings.connection.base_url()
    );

    let uploader = Uploader::new(repository, settings.project.clone(), patient_ids)
        .verify_checksum(settings.verify_checksum)
        .compression_level(settings.compression_level);
    let result = {
        let mut driver = BatchDriver::new(&uploader, settings.policy);
        if !settings.verbose {
            driver = driver.with_progress();
        }
        driver.run(&cli.inputs).await
    };
    uploader.into_repository().disconnect().await;

    let summary = result?;
    println!(
        "ingested: {}, created: {}, already present: {}, not imaging: {}, failed: {}",
        summary.ingested,
        summary.created,
        summary.already_present,
        summary.not_imaging,
        summary.failed.len()
    );
    for (path, reason) in &summary.failed {
        println!("failed: {}: {}", path.display(), reason);
    }
    summary.check()
}
