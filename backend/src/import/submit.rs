//! Accepting an upload and turning it into a `pending` import job.

use crate::error::ImportError;
use crate::import::encoding::TextEncoding;
use crate::import::job_store::{self, ImportJob, NewImportJob};
use chrono::{DateTime, Utc};
use common::requests::SubmitImportRequest;
use log::warn;
use md5::Context;
use rusqlite::Connection;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const ALLOWED_DELIMITERS: &[char] = &[',', ';', '\t', '|', ' '];
const SESSION_NAME_CHARS: usize = 15;

/// Checks the declared delimiter and encoding before any bytes are stored.
pub fn validate_request(request: &SubmitImportRequest) -> Result<(char, TextEncoding), ImportError> {
    let mut chars = request.delimiter.chars();
    let delimiter = match (chars.next(), chars.next()) {
        (Some(c), None) if ALLOWED_DELIMITERS.contains(&c) => c,
        _ => return Err(ImportError::InvalidDelimiter(request.delimiter.clone())),
    };
    let encoding = TextEncoding::from_label(&request.encoding)?;
    Ok((delimiter, encoding))
}

pub fn validate_file_name(file_name: &str) -> Result<(), ImportError> {
    if file_name.to_ascii_lowercase().ends_with(".csv") {
        Ok(())
    } else {
        Err(ImportError::Upload(format!(
            "'{}' is not a .csv file",
            file_name
        )))
    }
}

/// `imp_<YYYYmmdd_HHMMSS>_<file name prefix>_<6 hex>`.
pub fn session_id(file_name: &str, now: DateTime<Utc>) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let prefix: String = stem
        .chars()
        .take(SESSION_NAME_CHARS)
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "imp_{}_{}_{}",
        now.format("%Y%m%d_%H%M%S"),
        prefix,
        &suffix[..6]
    )
}

/// An upload written to its final location.
#[derive(Clone, Debug)]
pub struct StoredUpload {
    pub path: PathBuf,
    pub size: u64,
    pub md5: String,
}

/// Streams upload chunks into a temporary file in the upload directory,
/// hashing as it goes. Nothing becomes visible under the final name until
/// `persist` succeeds; a dropped sink leaves no file behind.
pub struct UploadSink {
    writer: BufWriter<NamedTempFile>,
    hasher: Context,
    size: u64,
    max_bytes: u64,
}

impl UploadSink {
    pub fn new(upload_dir: &Path, max_bytes: u64) -> Result<Self, ImportError> {
        std::fs::create_dir_all(upload_dir)?;
        Ok(Self {
            writer: BufWriter::new(NamedTempFile::new_in(upload_dir)?),
            hasher: Context::new(),
            size: 0,
            max_bytes,
        })
    }

    pub fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), ImportError> {
        self.size += chunk.len() as u64;
        if self.size > self.max_bytes {
            return Err(ImportError::Upload(format!(
                "file exceeds the {} MB limit",
                self.max_bytes / (1024 * 1024)
            )));
        }
        self.hasher.consume(chunk);
        self.writer.write_all(chunk)?;
        Ok(())
    }

    pub fn persist(self, target: &Path) -> Result<StoredUpload, ImportError> {
        if self.size == 0 {
            return Err(ImportError::Upload("file is empty".to_string()));
        }
        let file = self
            .writer
            .into_inner()
            .map_err(|e| ImportError::Io(e.into_error()))?;
        file.persist(target).map_err(|e| ImportError::Io(e.error))?;
        Ok(StoredUpload {
            path: target.to_path_buf(),
            size: self.size,
            md5: format!("{:x}", self.hasher.finalize()),
        })
    }
}

pub fn upload_path(upload_dir: &Path, session_id: &str) -> PathBuf {
    upload_dir.join(format!("{}.csv", session_id))
}

/// Records a stored upload as a new `pending` job. If no job can be created
/// the stored file is removed.
pub fn register(
    conn: &Connection,
    request: &SubmitImportRequest,
    file_name: &str,
    session_id: &str,
    upload: &StoredUpload,
) -> Result<ImportJob, ImportError> {
    let created = validate_request(request).and_then(|(delimiter, encoding)| {
        job_store::create(
            conn,
            &NewImportJob {
                session_id: session_id.to_string(),
                file_name: file_name.to_string(),
                file_size: upload.size as i64,
                file_md5: Some(upload.md5.clone()),
                delimiter,
                encoding: encoding.label().to_string(),
                has_header: request.has_header,
                upload_path: upload.path.clone(),
            },
        )
    });
    if created.is_err() {
        discard_upload(upload);
    }
    created
}

fn discard_upload(upload: &StoredUpload) {
    if let Err(e) = std::fs::remove_file(&upload.path) {
        warn!(
            "Could not remove rejected upload {}: {}",
            upload.path.display(),
            e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_database;
    use chrono::TimeZone;
    use common::jobs::ImportStatus;

    fn request(delimiter: &str, encoding: &str) -> SubmitImportRequest {
        SubmitImportRequest {
            delimiter: delimiter.to_string(),
            encoding: encoding.to_string(),
            has_header: true,
        }
    }

    #[test]
    fn delimiters_and_encodings_are_checked() {
        assert_eq!(
            validate_request(&request(";", "cp1251")).unwrap(),
            (';', TextEncoding::Windows1251)
        );
        assert_eq!(validate_request(&request("\t", "utf-8")).unwrap().0, '\t');
        assert!(matches!(
            validate_request(&request(";;", "utf-8")),
            Err(ImportError::InvalidDelimiter(_))
        ));
        assert!(matches!(
            validate_request(&request("x", "utf-8")),
            Err(ImportError::InvalidDelimiter(_))
        ));
        assert!(matches!(
            validate_request(&request(",", "koi8-r")),
            Err(ImportError::UnsupportedEncoding(_))
        ));
    }

    #[test]
    fn only_csv_files_are_accepted() {
        assert!(validate_file_name("dump.CSV").is_ok());
        assert!(validate_file_name("dump.xlsx").is_err());
    }

    #[test]
    fn session_id_layout() {
        let now = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        let id = session_id("my subscribers export 2024.csv", now);
        assert!(id.starts_with("imp_20240506_070809_my_subscribers__"), "{id}");
        assert_eq!(id.len(), "imp_20240506_070809_my_subscribers__".len() + 6);
        assert_ne!(id, session_id("my subscribers export 2024.csv", now));
    }

    #[test]
    fn upload_is_stored_hashed_and_registered() {
        let (dir, db) = temp_database();
        let conn = db.connect().unwrap();
        let uploads = dir.path().join("uploads");

        let mut sink = UploadSink::new(&uploads, 1024).unwrap();
        sink.write_chunk(b"1,99312345678,Ivanov,Ivan,,,,,,,\n").unwrap();
        let target = upload_path(&uploads, "imp_test");
        let stored = sink.persist(&target).unwrap();
        assert_eq!(stored.size, 33);
        assert_eq!(
            stored.md5,
            format!("{:x}", md5::compute(b"1,99312345678,Ivanov,Ivan,,,,,,,\n"))
        );
        assert!(target.is_file());

        let job = register(&conn, &request(",", "utf8"), "a.csv", "imp_test", &stored).unwrap();
        assert_eq!(job.status, ImportStatus::Pending);
        assert_eq!(job.encoding, "utf-8");
        assert_eq!(job.file_md5.as_deref(), Some(stored.md5.as_str()));
    }

    #[test]
    fn empty_and_oversized_uploads_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sink = UploadSink::new(dir.path(), 1024).unwrap();
        assert!(matches!(
            sink.persist(&dir.path().join("x.csv")),
            Err(ImportError::Upload(_))
        ));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        let mut sink = UploadSink::new(dir.path(), 4).unwrap();
        assert!(sink.write_chunk(b"12345").is_err());
    }

    #[test]
    fn rejected_registration_removes_the_upload() {
        let (dir, db) = temp_database();
        let conn = db.connect().unwrap();
        let uploads = dir.path().join("uploads");

        let mut sink = UploadSink::new(&uploads, 1024).unwrap();
        sink.write_chunk(b"1,99312345678,Ivanov,Ivan,,,,,,,\n").unwrap();
        let stored = sink.persist(&upload_path(&uploads, "imp_bad")).unwrap();

        let err = register(&conn, &request("::", "utf-8"), "a.csv", "imp_bad", &stored).unwrap_err();
        assert!(matches!(err, ImportError::InvalidDelimiter(_)));
        assert!(!stored.path.exists());

        // A second discard of the same file only logs.
        discard_upload(&stored);
    }
}
