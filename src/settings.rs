//! Run settings, layered from defaults, a TOML file, `DICOM_UPLOAD_*` environment
//! variables and command line flags (in increasing precedence).

use std::fmt;
use std::path::{Path, PathBuf};

use config::{Config, Environment, File, FileFormat};
use directories::BaseDirs;
use serde::Deserialize;
use snafu::prelude::*;

use crate::error::{InvalidSettingsSnafu, LoadSettingsSnafu, Result};
use crate::upload::archive::DEFAULT_COMPRESSION_LEVEL;
use crate::upload::FailurePolicy;
use crate::utils::Cid;

pub const ENV_PREFIX: &str = "DICOM_UPLOAD";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Http,
    #[default]
    Https,
}

impl Transport {
    pub fn scheme(self) -> &'static str {
        match self {
            Transport::Http => "http",
            Transport::Https => "https",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Transport::Http => 80,
            Transport::Https => 443,
        }
    }
}

impl std::str::FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Transport::Http),
            "https" => Ok(Transport::Https),
            other => Err(format!("unsupported transport '{}', expected http or https", other)),
        }
    }
}

/// Connection section of the settings file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub transport: Transport,
    pub token: Option<String>,
    pub sid: Option<String>,
    /// `domain,user,password`
    pub auth: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Project cid all uploads go into
    pub project: Option<String>,
    pub patient_id_map: Option<PathBuf>,
    pub continue_on_error: bool,
    pub csum: bool,
    pub compression_level: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            project: None,
            patient_id_map: None,
            continue_on_error: false,
            csum: false,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

/// Raw settings as loaded from file and environment.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub connection: ConnectionConfig,
    pub upload: UploadConfig,
    pub verbose: bool,
    /// Also write the log to a file
    pub logging: bool,
}

/// `~/.dicom-upload/settings.toml`
pub fn default_settings_path() -> Option<PathBuf> {
    BaseDirs::new().map(|dirs| dirs.home_dir().join(".dicom-upload").join("settings.toml"))
}

impl Settings {
    /// Loads the settings file and the environment.
    ///
    /// An explicitly given file must exist; the default one is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        match path {
            Some(path) => {
                builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
            }
            None => {
                if let Some(default) = default_settings_path() {
                    builder = builder
                        .add_source(File::from(default).format(FileFormat::Toml).required(false));
                }
            }
        }
        builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context(LoadSettingsSnafu)?
            .try_deserialize()
            .context(LoadSettingsSnafu)
    }

    /// Validates the settings into what a run needs.
    pub fn resolve(self) -> Result<RunSettings> {
        let connection = self.connection;
        let host = connection
            .host
            .filter(|h| !h.trim().is_empty())
            .context(InvalidSettingsSnafu {
                message: "no repository host given",
            })?;
        let authentication = match (connection.token, connection.sid, connection.auth) {
            (Some(token), _, _) => Authentication::Token(token),
            (None, Some(sid), _) => Authentication::Session(sid),
            (None, None, Some(auth)) => Authentication::parse_credentials(&auth)?,
            (None, None, None) => {
                return InvalidSettingsSnafu {
                    message: "no authentication given, use a token, a session id or domain,user,password",
                }
                .fail()
            }
        };

        let upload = self.upload;
        let project = upload.project.context(InvalidSettingsSnafu {
            message: "no project cid given",
        })?;
        let project: Cid = project.parse().map_err(|e| {
            InvalidSettingsSnafu {
                message: format!("{}", e),
            }
            .build()
        })?;
        let patient_id_map = upload.patient_id_map.context(InvalidSettingsSnafu {
            message: "no patient id map given",
        })?;
        ensure!(
            upload.compression_level <= 9,
            InvalidSettingsSnafu {
                message: format!(
                    "compression level {} is out of range 0..=9",
                    upload.compression_level
                ),
            }
        );

        Ok(RunSettings {
            connection: ConnectionSettings {
                transport: connection.transport,
                port: connection
                    .port
                    .unwrap_or_else(|| connection.transport.default_port()),
                host,
                authentication,
            },
            project,
            patient_id_map,
            policy: if upload.continue_on_error {
                FailurePolicy::ContinueOnError
            } else {
                FailurePolicy::StopOnError
            },
            verify_checksum: upload.csum,
            compression_level: upload.compression_level,
            verbose: self.verbose,
            logging: self.logging,
        })
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum Authentication {
    Token(String),
    Session(String),
    Credentials {
        domain: String,
        user: String,
        password: String,
    },
}

impl Authentication {
    fn parse_credentials(auth: &str) -> Result<Self> {
        let parts: Vec<&str> = auth.splitn(3, ',').map(str::trim).collect();
        match parts.as_slice() {
            [domain, user, password] if !domain.is_empty() && !user.is_empty() => {
                Ok(Authentication::Credentials {
                    domain: domain.to_string(),
                    user: user.to_string(),
                    password: password.to_string(),
                })
            }
            _ => InvalidSettingsSnafu {
                message: "authentication must read domain,user,password",
            }
            .fail(),
        }
    }
}

// keeps secrets out of logs
impl fmt::Debug for Authentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authentication::Token(_) => f.write_str("Token(***)"),
            Authentication::Session(_) => f.write_str("Session(***)"),
            Authentication::Credentials { domain, user, .. } => f
                .debug_struct("Credentials")
                .field("domain", domain)
                .field("user", user)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub transport: Transport,
    pub host: String,
    pub port: u16,
    pub authentication: Authentication,
}

impl ConnectionSettings {
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.transport.scheme(), self.host, self.port)
    }
}

/// Validated settings of one run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub connection: ConnectionSettings,
    pub project: Cid,
    pub patient_id_map: PathBuf,
    pub policy: FailurePolicy,
    pub verify_checksum: bool,
    pub compression_level: u32,
    pub verbose: bool,
    pub logging: bool,
}
