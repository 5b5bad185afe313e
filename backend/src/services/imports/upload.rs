use crate::error::ImportError;
use crate::import::submit::{self, StoredUpload, UploadSink};
use crate::job_controller::state::JobsState;
use crate::services::error_response;
use actix_multipart::{Multipart, MultipartError};
use actix_web::{web, HttpResponse, Responder};
use chrono::Utc;
use common::model::import_job::SubmittedImport;
use common::requests::SubmitImportRequest;
use futures_util::StreamExt;
use log::info;
use serde_json::from_slice;

fn multipart_error(e: MultipartError) -> ImportError {
    ImportError::Upload(e.to_string())
}

/// - On success: `200 OK` with `{job_id, session_id}`.
/// - On a bad upload: `400 Bad Request` with the reason.
pub async fn process(payload: Multipart, state: web::Data<JobsState>) -> impl Responder {
    match submit_import(payload, &state).await {
        Ok(submitted) => HttpResponse::Ok().json(submitted),
        Err(e) => error_response(&e),
    }
}

async fn submit_import(
    mut payload: Multipart,
    state: &JobsState,
) -> Result<SubmittedImport, ImportError> {
    let mut request: Option<SubmitImportRequest> = None;
    let mut stored: Option<(String, String, StoredUpload)> = None;

    while let Some(item) = payload.next().await {
        let mut field = item.map_err(multipart_error)?;
        let part_name = field
            .content_disposition()
            .and_then(|cd| cd.get_name().map(|n| n.to_string()));

        match part_name.as_deref() {
            Some("json") => {
                let mut bytes = Vec::new();
                while let Some(chunk) = field.next().await {
                    bytes.extend_from_slice(&chunk.map_err(multipart_error)?);
                }
                let parsed: SubmitImportRequest = from_slice(&bytes)
                    .map_err(|e| ImportError::Upload(format!("invalid json part: {}", e)))?;
                submit::validate_request(&parsed)?;
                request = Some(parsed);
            }

            Some("file") => {
                if request.is_none() {
                    return Err(ImportError::Upload(
                        "the json part must be sent before the file".to_string(),
                    ));
                }
                let file_name = field
                    .content_disposition()
                    .and_then(|cd| cd.get_filename().map(|f| f.to_string()))
                    .unwrap_or_default();
                submit::validate_file_name(&file_name)?;

                let session_id = submit::session_id(&file_name, Utc::now());
                let mut sink = UploadSink::new(&state.upload_dir, state.max_upload_bytes)?;
                while let Some(chunk) = field.next().await {
                    sink.write_chunk(&chunk.map_err(multipart_error)?)?;
                }
                let upload = sink.persist(&submit::upload_path(&state.upload_dir, &session_id))?;
                stored = Some((file_name, session_id, upload));
            }

            _ => {}
        }
    }

    let request = request.ok_or_else(|| ImportError::Upload("missing json part".to_string()))?;
    let (file_name, session_id, upload) =
        stored.ok_or_else(|| ImportError::Upload("missing file part".to_string()))?;

    let job = {
        let (file_name, session_id, upload) =
            (file_name.clone(), session_id.clone(), upload.clone());
        state
            .run_blocking(move |conn| {
                submit::register(conn, &request, &file_name, &session_id, &upload)
            })
            .await?
    };
    info!(
        "Import job {} ({}) created for {} ({} bytes, md5 {})",
        job.id, session_id, file_name, upload.size, upload.md5
    );

    state.start_worker(job.id).await;
    Ok(SubmittedImport {
        job_id: job.id,
        session_id,
    })
}
