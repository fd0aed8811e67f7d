pub use chrono::{DateTime, Utc};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, path::Path};

use crate::error::GatewayError;

const PHOTO_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "heic", "heif", "gif", "tif", "tiff", "webp", "bmp", "dng", "cr2", "nef",
    "arw",
];
const VIDEO_EXTENSIONS: &[&str] = &["mov", "mp4", "m4v", "avi", "3gp", "mkv", "hevc"];

/// A single photo or video in the remote library.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaItem {
    pub id: String,
    /// Not unique across the library.
    pub filename: String,
    pub created_at: DateTime<Utc>,
    pub byte_size: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub download_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Photo,
    Video,
    Unknown,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
            MediaKind::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

impl MediaItem {
    /// Guessed from the file extension; the remote item type is not consulted.
    pub fn kind(&self) -> MediaKind {
        let extension = Path::new(&self.filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        match extension.as_deref() {
            Some(e) if PHOTO_EXTENSIONS.contains(&e) => MediaKind::Photo,
            Some(e) if VIDEO_EXTENSIONS.contains(&e) => MediaKind::Video,
            _ => MediaKind::Unknown,
        }
    }

    pub fn dimensions(&self) -> Option<String> {
        match (self.width, self.height) {
            (Some(width), Some(height)) => Some(format!("{width}x{height}")),
            _ => None,
        }
    }

    /// Size in kilobytes, rounded to two decimal places.
    pub fn size_kb(&self) -> Option<f64> {
        self.byte_size
            .map(|size| (size as f64 / 1024.0 * 100.0).round() / 100.0)
    }
}

// CloudKit wire format.

#[derive(Serialize, Deserialize, Default)]
pub struct QueryResponse {
    #[serde(default)]
    pub records: Vec<Record>,
}

#[derive(Serialize, Deserialize)]
pub struct BatchResponse {
    #[serde(default)]
    pub batch: Vec<QueryResponse>,
}

#[derive(Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "recordName")]
    pub record_name: String,
    #[serde(rename = "recordType", default)]
    pub record_type: String,
    #[serde(default)]
    pub fields: RecordFields,
}

#[derive(Serialize, Deserialize, Default)]
pub struct RecordFields {
    #[serde(rename = "filenameEnc")]
    pub filename_enc: Option<Field<String>>,
    #[serde(rename = "resOriginalRes")]
    pub res_original_res: Option<Field<Resource>>,
    #[serde(rename = "resOriginalWidth")]
    pub res_original_width: Option<Field<u32>>,
    #[serde(rename = "resOriginalHeight")]
    pub res_original_height: Option<Field<u32>>,
    #[serde(rename = "masterRef")]
    pub master_ref: Option<Field<Reference>>,
    #[serde(rename = "assetDate")]
    pub asset_date: Option<Field<i64>>,
    #[serde(rename = "itemCount")]
    pub item_count: Option<Field<u64>>,
}

#[derive(Serialize, Deserialize)]
pub struct Field<T> {
    pub value: T,
}

#[derive(Serialize, Deserialize)]
pub struct Resource {
    pub size: Option<u64>,
    #[serde(rename = "downloadURL")]
    pub download_url: String,
}

#[derive(Serialize, Deserialize)]
pub struct Reference {
    #[serde(rename = "recordName")]
    pub record_name: String,
}

#[derive(Serialize, Deserialize)]
pub struct AccountLoginResponse {
    #[serde(rename = "dsInfo")]
    pub ds_info: DsInfo,
    pub webservices: Option<Webservices>,
    #[serde(rename = "hsaChallengeRequired", default)]
    pub hsa_challenge_required: bool,
}

#[derive(Serialize, Deserialize)]
pub struct DsInfo {
    pub dsid: serde_json::Value,
    #[serde(rename = "hsaVersion", default)]
    pub hsa_version: u8,
}

impl DsInfo {
    /// Apple sends the dsid either as a string or as a number.
    pub fn dsid_string(&self) -> Option<String> {
        match &self.dsid {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct Webservices {
    pub ckdatabasews: Option<Endpoint>,
}

#[derive(Serialize, Deserialize)]
pub struct Endpoint {
    pub url: String,
}

/// One page of query results, joined into media items.
pub struct MediaPage {
    pub items: Vec<Result<MediaItem, GatewayError>>,
    /// Number of ranks the page consumed.
    pub ranks: u64,
    /// The query returned no records at all.
    pub end_of_library: bool,
}

impl QueryResponse {
    /// Pairs each `CPLAsset` with the `CPLMaster` it references.
    pub fn into_media_page(self) -> MediaPage {
        let end_of_library = self.records.is_empty();
        let mut masters: HashMap<String, Record> = HashMap::new();
        let mut assets = Vec::new();
        for record in self.records {
            match record.record_type.as_str() {
                "CPLMaster" => {
                    masters.insert(record.record_name.clone(), record);
                }
                "CPLAsset" => assets.push(record),
                _ => {}
            }
        }

        // Every rank holds one asset and one master; either count advances the query.
        let ranks = masters.len().max(assets.len()) as u64;
        let items = assets
            .into_iter()
            .map(|asset| {
                let Some(master_ref) = asset.fields.master_ref.as_ref() else {
                    return Err(GatewayError::Malformed(format!(
                        "asset {} has no master reference",
                        asset.record_name
                    )));
                };
                let master_name = &master_ref.value.record_name;
                match masters.get(master_name) {
                    Some(master) => media_item_from_records(&asset, master),
                    None => Err(GatewayError::Malformed(format!(
                        "asset {} references missing master {master_name}",
                        asset.record_name
                    ))),
                }
            })
            .collect();

        MediaPage {
            items,
            ranks,
            end_of_library,
        }
    }
}

impl BatchResponse {
    pub fn item_count(&self) -> Option<u64> {
        self.batch
            .first()?
            .records
            .first()?
            .fields
            .item_count
            .as_ref()
            .map(|field| field.value)
    }
}

fn media_item_from_records(asset: &Record, master: &Record) -> Result<MediaItem, GatewayError> {
    let missing =
        |what: &str| GatewayError::Malformed(format!("{} has no {what}", master.record_name));

    let encoded = master
        .fields
        .filename_enc
        .as_ref()
        .ok_or_else(|| missing("filename"))?;
    let decoded = STANDARD
        .decode(encoded.value.as_bytes())
        .map_err(|e| GatewayError::Malformed(format!("bad filename encoding: {e}")))?;
    let filename = String::from_utf8(decoded)
        .map_err(|e| GatewayError::Malformed(format!("filename is not UTF-8: {e}")))?;

    let millis = asset
        .fields
        .asset_date
        .as_ref()
        .ok_or_else(|| missing("asset date"))?
        .value;
    let created_at = DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| GatewayError::Malformed(format!("asset date {millis} out of range")))?;

    let resource = master
        .fields
        .res_original_res
        .as_ref()
        .ok_or_else(|| missing("original resource"))?;

    Ok(MediaItem {
        id: master.record_name.clone(),
        filename,
        created_at,
        byte_size: resource.value.size,
        width: master.fields.res_original_width.as_ref().map(|f| f.value),
        height: master.fields.res_original_height.as_ref().map(|f| f.value),
        download_url: resource.value.download_url.clone(),
    })
}
