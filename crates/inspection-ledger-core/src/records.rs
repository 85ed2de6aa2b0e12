use serde::{Deserialize, Serialize};

use crate::{Detection, LedgerError, OrganizationId, PublicRecord, TxProvenance};

/// Confidential projection shared by both inspection families: the submitting
/// individual's identity, visible only to the organization that wrote it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InspectorIdentity {
    pub inspector: String,
}

/// Public projection of an AI composite-defect inspection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct DefectInspectionPublic {
    pub part_number: String,
    pub serial_number: String,
    pub material_type: String,

    pub inspection_date: String,
    pub inspection_type: String,
    pub organization: String,

    pub raw_video_hash: String,
    #[serde(rename = "rawVideoIPFS")]
    pub raw_video_ipfs: String,
    pub raw_video_size: i64,
    pub processed_image_hash: String,
    #[serde(rename = "processedImageIPFS")]
    pub processed_image_ipfs: String,

    #[serde(rename = "roi_y1")]
    pub roi_y1: i32,
    #[serde(rename = "roi_y2")]
    pub roi_y2: i32,
    #[serde(rename = "roi_x1")]
    pub roi_x1: i32,
    #[serde(rename = "roi_x2")]
    pub roi_x2: i32,

    pub pulse_time: i32,
    pub pca_components: i32,
    pub sequence_length: i32,

    pub model_name: String,
    pub model_version: String,
    pub model_hash: String,

    pub defect_detected: bool,
    pub defect_type: String,
    pub confidence_score: f64,

    #[serde(rename = "bbox_x1")]
    pub bbox_x1: f64,
    #[serde(rename = "bbox_y1")]
    pub bbox_y1: f64,
    #[serde(rename = "bbox_x2")]
    pub bbox_x2: f64,
    #[serde(rename = "bbox_y2")]
    pub bbox_y2: f64,

    pub iou: f64,
    pub center_distance: f64,
    pub norm_center_distance: f64,

    pub has_ground_truth: bool,
    #[serde(rename = "gt_bbox_x1")]
    pub gt_bbox_x1: f64,
    #[serde(rename = "gt_bbox_y1")]
    pub gt_bbox_y1: f64,
    #[serde(rename = "gt_bbox_x2")]
    pub gt_bbox_x2: f64,
    #[serde(rename = "gt_bbox_y2")]
    pub gt_bbox_y2: f64,

    #[serde(rename = "txID")]
    pub tx_id: String,
    pub blockchain_timestamp: String,
    pub submitted_at: String,
}

impl PublicRecord for DefectInspectionPublic {
    type Private = InspectorIdentity;

    const NAMESPACE: &'static str = "ai-defect-inspection";

    fn part_number(&self) -> &str {
        &self.part_number
    }

    fn serial_number(&self) -> &str {
        &self.serial_number
    }

    /// The writer's organization is recorded inside the public projection
    /// in addition to routing the private half by it.
    fn stamp_write(
        &mut self,
        provenance: &TxProvenance,
        organization: &OrganizationId,
    ) -> Result<(), LedgerError> {
        let committed_at = provenance.committed_at()?;
        if self.submitted_at.trim().is_empty() {
            self.submitted_at.clone_from(&committed_at);
        }
        self.organization = organization.as_str().to_string();
        self.set_provenance(&provenance.tx_id, &committed_at);
        Ok(())
    }

    fn set_provenance(&mut self, tx_id: &str, committed_at: &str) {
        self.tx_id = tx_id.to_string();
        self.blockchain_timestamp = committed_at.to_string();
    }

    fn evidence_hash(&self) -> &str {
        &self.raw_video_hash
    }

    fn detection(&self) -> Option<Detection> {
        Some(Detection {
            defect_detected: self.defect_detected,
            confidence_score: self.confidence_score,
        })
    }
}

/// The fourteen chord measurement stations of a blade, in millimetres.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChordMeasurements {
    pub ar: f64,
    pub ap: f64,
    pub an: f64,
    pub am: f64,
    pub al: f64,
    pub ak: f64,
    pub aj: f64,
    pub ah: f64,
    pub ag: f64,
    pub af: f64,
    pub ae: f64,
    pub ad: f64,
    pub ac: f64,
    pub ab: f64,
}

/// Public projection of a blade chord-measurement inspection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct BladeInspectionPublic {
    pub part_number: String,
    pub serial_number: String,
    /// e.g. `before_surfacing`, `manual`, `after_surfacing`.
    pub occasion_label: String,
    pub inspection_date: String,
    pub submitted_at: String,
    pub organization: String,
    pub measurements: ChordMeasurements,
    pub csv_hash: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub tx_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub blockchain_timestamp: String,
}

impl PublicRecord for BladeInspectionPublic {
    type Private = InspectorIdentity;

    const NAMESPACE: &'static str = "blade-inspection";
    const OCCASION_FIELD: Option<&'static str> = Some("occasionLabel");

    fn part_number(&self) -> &str {
        &self.part_number
    }

    fn serial_number(&self) -> &str {
        &self.serial_number
    }

    fn stamp_write(
        &mut self,
        provenance: &TxProvenance,
        _organization: &OrganizationId,
    ) -> Result<(), LedgerError> {
        let committed_at = provenance.committed_at()?;
        if self.submitted_at.trim().is_empty() {
            self.submitted_at.clone_from(&committed_at);
        }
        self.set_provenance(&provenance.tx_id, &committed_at);
        Ok(())
    }

    fn set_provenance(&mut self, tx_id: &str, committed_at: &str) {
        self.tx_id = tx_id.to_string();
        self.blockchain_timestamp = committed_at.to_string();
    }

    fn evidence_hash(&self) -> &str {
        &self.csv_hash
    }

    fn occasion_label(&self) -> Option<&str> {
        Some(&self.occasion_label)
    }
}
