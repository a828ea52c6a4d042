//! In-page fetch plumbing shared by the vendor flows.
//!
//! Every vendor call rides the page's own cookies and anti-bot headers by
//! running `fetch` inside the page instead of from the gateway process.

use base64::Engine;
use serde_json::Value;

use crate::runtime::VendorError;

/// Script that performs an in-page fetch and returns
/// `{ status, data, error }`; `status` 0 means the fetch itself threw.
pub(crate) fn fetch_json_script(
    method: &str,
    url: &str,
    bearer: Option<&str>,
    body: Option<&Value>,
) -> String {
    let auth_line = match bearer {
        Some(token) => format!(
            "'authorization': {},",
            Value::String(format!("Bearer {token}"))
        ),
        None => String::new(),
    };
    let body_line = match body {
        Some(body) => format!("body: JSON.stringify({body}),"),
        None => String::new(),
    };
    format!(
        r#"(async () => {{
  try {{
    const response = await fetch({url}, {{
      method: {method},
      headers: {{
        'Accept': 'application/json, text/plain, */*',
        'Content-Type': 'application/json',
        {auth_line}
      }},
      {body_line}
    }});
    const data = await response.json().catch(() => null);
    return {{ status: response.status, data: data, error: null }};
  }} catch (error) {{
    return {{ status: 0, data: null, error: String(error) }};
  }}
}})()"#,
        url = Value::String(url.to_string()),
        method = Value::String(method.to_string()),
    )
}

/// Like [`fetch_json_script`] but posts the given base64 image as a
/// multipart file upload.
pub(crate) fn upload_image_script(url: &str, bearer: &str, base64_png: &str) -> String {
    format!(
        r#"(async () => {{
  try {{
    const blob = await (await fetch({data_url})).blob();
    const formData = new FormData();
    formData.append('file', blob, 'upload.png');
    const response = await fetch({url}, {{
      method: 'POST',
      headers: {{ 'authorization': {auth} }},
      body: formData
    }});
    const data = await response.json().catch(() => null);
    return {{ status: response.status, data: data, error: null }};
  }} catch (error) {{
    return {{ status: 0, data: null, error: String(error) }};
  }}
}})()"#,
        data_url = Value::String(format!("data:image/png;base64,{base64_png}")),
        url = Value::String(url.to_string()),
        auth = Value::String(format!("Bearer {bearer}")),
    )
}

/// Script that fetches a binary resource in-page and returns it base64
/// encoded, or null when it is not (yet) available.
pub(crate) fn fetch_base64_script(url: &str) -> String {
    fetch_base64_script_inner(url, None)
}

/// [`fetch_base64_script`] with a bearer token attached.
pub(crate) fn fetch_base64_bearer_script(url: &str, bearer: &str) -> String {
    fetch_base64_script_inner(url, Some(bearer))
}

fn fetch_base64_script_inner(url: &str, bearer: Option<&str>) -> String {
    let headers = match bearer {
        Some(token) => format!(
            ", {{ headers: {{ 'authorization': {} }} }}",
            Value::String(format!("Bearer {token}"))
        ),
        None => String::new(),
    };
    format!(
        r#"(async () => {{
  try {{
    const response = await fetch({url}{headers});
    if (!response.ok) return null;
    const bytes = new Uint8Array(await response.arrayBuffer());
    let binary = '';
    for (let i = 0; i < bytes.length; i++) binary += String.fromCharCode(bytes[i]);
    return btoa(binary);
  }} catch (_) {{
    return null;
  }}
}})()"#,
        url = Value::String(url.to_string()),
    )
}

/// Interprets the `{ status, data, error }` shape produced by
/// [`fetch_json_script`], mapping transport and HTTP failures onto the
/// vendor error taxonomy.
pub(crate) fn parse_fetch_result(value: Value) -> Result<(u16, Value), VendorError> {
    let status = value
        .get("status")
        .and_then(Value::as_u64)
        .ok_or_else(|| VendorError::Protocol(String::from("fetch result missing status")))?;
    if status == 0 {
        let error = value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("fetch failed");
        return Err(VendorError::Network(error.to_string()));
    }
    let data = value.get("data").cloned().unwrap_or(Value::Null);
    if !(200..300).contains(&status) {
        return Err(VendorError::Http {
            status: status as u16,
            message: data.to_string(),
        });
    }
    Ok((status as u16, data))
}

pub(crate) fn decode_base64(encoded: &str) -> Result<Vec<u8>, VendorError> {
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|err| VendorError::Protocol(format!("invalid base64 payload: {err}")))
}
