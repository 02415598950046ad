//! C5 — concatenates backend output with advertisement prefaces and sideband
//! messages, then computes the outgoing `Content-Type`/`Content-Length`.

use bytes::Bytes;

use crate::driver::DriverResponse;
use crate::headers::Headers;
use crate::request::{RequestData, Service};

/// `body`, `headers`, `statusCode`, `statusMessage` — the immutable response
/// the controller hands back to the host binding.
#[derive(Debug, Clone)]
pub struct ResponseData {
    pub body: Bytes,
    pub headers: Headers,
    pub status_code: u16,
    pub status_message: String,
}

fn reason_phrase(code: u16) -> &'static str {
    match code {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Error",
    }
}

/// The exact bytes Git clients expect to lead an advertisement response —
/// prepended only when the driver's body doesn't already carry them.
fn advertisement_preface(service: Service) -> &'static [u8] {
    match service {
        Service::UploadPack => b"001e# service=git-upload-pack\n0000",
        Service::ReceivePack => b"001f# service=git-receive-pack\n0000",
    }
}

fn plain_text_response(status_code: u16, message: String) -> ResponseData {
    let body = Bytes::from(message.clone().into_bytes());
    let mut headers = Headers::new();
    let _ = headers.set("content-type", "text/plain; charset=utf-8");
    let _ = headers.set("content-length", body.len().to_string());
    ResponseData {
        body,
        headers,
        status_code,
        status_message: message,
    }
}

/// Builds a plain-text rejection response for `code`, defaulting the message
/// to the standard HTTP reason phrase.
pub fn rejection(code: u16, message: Option<String>) -> ResponseData {
    let message = message.unwrap_or_else(|| reason_phrase(code).to_string());
    plain_text_response(code, message)
}

/// Frames a successful [`DriverResponse`] into a [`ResponseData`], per the
/// five-step algorithm: reject on `status_code >= 400`, pass empty bodies
/// through unframed, prepend the advertisement preface when missing, or
/// splice in accumulated sideband frames ahead of the rpc body's final flush.
pub fn frame(
    request: &RequestData,
    driver_response: DriverResponse,
    sideband_messages: &[Bytes],
) -> Result<ResponseData, crate::error::PktLineError> {
    if driver_response.status_code >= 400 {
        if !driver_response.body.is_empty() {
            let mut headers = Headers::new();
            let _ = headers.set("content-length", driver_response.body.len().to_string());
            return Ok(ResponseData {
                body: driver_response.body,
                headers,
                status_code: driver_response.status_code,
                status_message: driver_response
                    .status_message
                    .unwrap_or_else(|| reason_phrase(driver_response.status_code).to_string()),
            });
        }
        let message = driver_response
            .status_message
            .unwrap_or_else(|| reason_phrase(driver_response.status_code).to_string());
        return Ok(plain_text_response(driver_response.status_code, message));
    }

    if driver_response.body.is_empty() {
        return Ok(ResponseData {
            body: driver_response.body,
            headers: Headers::new(),
            status_code: driver_response.status_code,
            status_message: driver_response
                .status_message
                .unwrap_or_else(|| reason_phrase(driver_response.status_code).to_string()),
        });
    }

    let Some(service) = request.service else {
        // No service to frame advertisement/rpc content types against; pass
        // the driver body through unframed, matching the empty-body branch.
        return Ok(ResponseData {
            body: driver_response.body,
            headers: Headers::new(),
            status_code: driver_response.status_code,
            status_message: driver_response
                .status_message
                .unwrap_or_else(|| reason_phrase(driver_response.status_code).to_string()),
        });
    };

    let mut headers = Headers::new();
    let body = if request.is_advertisement {
        let preface = advertisement_preface(service);
        let body = if driver_response.body.starts_with(preface) {
            driver_response.body
        } else {
            let mut out = Vec::with_capacity(preface.len() + driver_response.body.len());
            out.extend_from_slice(preface);
            out.extend_from_slice(&driver_response.body);
            Bytes::from(out)
        };
        let _ = headers.set(
            "content-type",
            format!("application/x-git-{service}-advertisement"),
        );
        body
    } else {
        let mut buffers = vec![driver_response.body];
        buffers.extend(sideband_messages.iter().cloned());
        let body = crate::pktline::concat_packets(&buffers, Some(0))?;
        let _ = headers.set("content-type", format!("application/x-git-{service}-result"));
        body
    };

    let _ = headers.set("content-length", body.len().to_string());

    Ok(ResponseData {
        body,
        headers,
        status_code: driver_response.status_code,
        status_message: driver_response
            .status_message
            .unwrap_or_else(|| reason_phrase(driver_response.status_code).to_string()),
    })
}
