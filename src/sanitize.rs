#![forbid(unsafe_code)]

//! Provider-specific id validation applied before items reach the engine.
//!
//! Ids may arrive bare (`dQw4w9WgXcQ`) or embedded in a pasted URL; both forms
//! normalize to the bare id. Anything that does not look like a YouTube id is
//! rejected so junk never ends up in the lists or the metrics.

use crate::models::ContentType;

const VIDEO_ID_LEN: usize = 11;
const CHANNEL_ID_LEN: usize = 24;
const MIN_HANDLE_LEN: usize = 3;
const MAX_HANDLE_LEN: usize = 30;
const MIN_PLAYLIST_LEN: usize = 2;
const MAX_PLAYLIST_LEN: usize = 64;

/// Returns the normalized id, or `None` when `raw` is not a usable id for
/// the given content type.
pub fn sanitize_item_id(content_type: ContentType, raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match content_type {
        ContentType::Video => extract_video_id(trimmed),
        ContentType::Channel => extract_channel_id(trimmed),
        ContentType::Playlist => extract_playlist_id(trimmed),
    }
}

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn is_video_id(value: &str) -> bool {
    value.len() == VIDEO_ID_LEN && value.chars().all(is_id_char)
}

fn is_channel_id(value: &str) -> bool {
    value.len() == CHANNEL_ID_LEN && value.starts_with("UC") && value.chars().all(is_id_char)
}

fn is_handle(value: &str) -> bool {
    let Some(name) = value.strip_prefix('@') else {
        return false;
    };
    (MIN_HANDLE_LEN..=MAX_HANDLE_LEN).contains(&name.len())
        && name.chars().all(|c| is_id_char(c) || c == '.')
}

fn is_playlist_id(value: &str) -> bool {
    (MIN_PLAYLIST_LEN..=MAX_PLAYLIST_LEN).contains(&value.len()) && value.chars().all(is_id_char)
}

fn extract_video_id(value: &str) -> Option<String> {
    if is_video_id(value) {
        return Some(value.to_string());
    }
    query_param(value, "v")
        .or_else(|| segment_after(value, "youtu.be/"))
        .or_else(|| segment_after(value, "/shorts/"))
        .or_else(|| segment_after(value, "/embed/"))
        .or_else(|| segment_after(value, "/live/"))
        .filter(|candidate| is_video_id(candidate))
        .map(str::to_string)
}

fn extract_channel_id(value: &str) -> Option<String> {
    if is_channel_id(value) || is_handle(value) {
        return Some(value.to_string());
    }
    if let Some(candidate) = segment_after(value, "/channel/")
        && is_channel_id(candidate)
    {
        return Some(candidate.to_string());
    }
    segment_after(value, "/@")
        .map(|name| format!("@{name}"))
        .filter(|handle| is_handle(handle))
}

fn extract_playlist_id(value: &str) -> Option<String> {
    if is_playlist_id(value) {
        return Some(value.to_string());
    }
    query_param(value, "list")
        .filter(|candidate| is_playlist_id(candidate))
        .map(str::to_string)
}

fn query_param<'a>(url: &'a str, key: &str) -> Option<&'a str> {
    let (_, query) = url.split_once('?')?;
    let query = query.split('#').next().unwrap_or(query);
    query.split('&').find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        (name == key && !value.is_empty()).then_some(value)
    })
}

fn segment_after<'a>(url: &'a str, marker: &str) -> Option<&'a str> {
    let (_, rest) = url.split_once(marker)?;
    rest.split(['/', '?', '&', '#'])
        .next()
        .filter(|segment| !segment.is_empty())
}
