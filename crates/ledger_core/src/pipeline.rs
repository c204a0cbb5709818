use thiserror::Error;

use crate::ledger::{DocumentIngestStatus, DocumentVersions, LedgerState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Transformation,
    Output,
}

/// One transformation or output step, named by the connection that performs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStage {
    pub connection_name: String,
    pub kind: StageKind,
    /// Index of the transformation stage feeding this one; `None` for stages fed by the source.
    pub prerequisite: Option<usize>,
    /// Version string computed by the stage's connector for the current configuration.
    pub version: String,
}

impl PipelineStage {
    pub fn transformation(
        connection_name: impl Into<String>,
        prerequisite: Option<usize>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            connection_name: connection_name.into(),
            kind: StageKind::Transformation,
            prerequisite,
            version: version.into(),
        }
    }

    pub fn output(
        connection_name: impl Into<String>,
        prerequisite: Option<usize>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            connection_name: connection_name.into(),
            kind: StageKind::Output,
            prerequisite,
            version: version.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("stage {stage} names a prerequisite {prerequisite} that is not an earlier stage")]
    PrerequisiteOutOfOrder { stage: usize, prerequisite: usize },
    #[error("stage {stage} depends on output stage {prerequisite}; outputs must be leaves")]
    PrerequisiteIsOutput { stage: usize, prerequisite: usize },
    #[error("output connection '{connection}' appears more than once in the pipeline")]
    DuplicateOutput { connection: String },
    #[error("pipeline has no output stage")]
    NoOutputs,
}

/// Ordered pipeline description for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSpec {
    stages: Vec<PipelineStage>,
}

impl PipelineSpec {
    pub fn new(stages: Vec<PipelineStage>) -> Result<Self, PipelineError> {
        let mut outputs = std::collections::HashSet::new();
        for (index, stage) in stages.iter().enumerate() {
            if let Some(prerequisite) = stage.prerequisite {
                if prerequisite >= index {
                    return Err(PipelineError::PrerequisiteOutOfOrder {
                        stage: index,
                        prerequisite,
                    });
                }
                if stages[prerequisite].kind == StageKind::Output {
                    return Err(PipelineError::PrerequisiteIsOutput {
                        stage: index,
                        prerequisite,
                    });
                }
            }
            if stage.kind == StageKind::Output && !outputs.insert(stage.connection_name.as_str()) {
                return Err(PipelineError::DuplicateOutput {
                    connection: stage.connection_name.clone(),
                });
            }
        }
        if outputs.is_empty() {
            return Err(PipelineError::NoOutputs);
        }
        Ok(Self { stages })
    }

    /// Single-output pipeline with no transformations.
    pub fn single_output(connection_name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            stages: vec![PipelineStage::output(connection_name, None, version)],
        }
    }

    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }

    pub fn stage(&self, index: usize) -> Option<&PipelineStage> {
        self.stages.get(index)
    }

    pub fn output_stages(&self) -> impl Iterator<Item = (usize, &PipelineStage)> {
        self.stages
            .iter()
            .enumerate()
            .filter(|(_, stage)| stage.kind == StageKind::Output)
    }

    pub fn output_connection_names(&self) -> Vec<String> {
        self.output_stages()
            .map(|(_, stage)| stage.connection_name.clone())
            .collect()
    }

    /// Transformation stages feeding `stage`, from the source side to its direct prerequisite.
    pub fn transformation_path(&self, stage: usize) -> Vec<usize> {
        let mut path = Vec::new();
        let mut cursor = self.stages.get(stage).and_then(|s| s.prerequisite);
        while let Some(index) = cursor {
            path.push(index);
            cursor = self.stages.get(index).and_then(|s| s.prerequisite);
        }
        path.reverse();
        path
    }

    /// Packs the `(connection, version)` pairs of the transformation path into one string.
    ///
    /// A change to any upstream transformation's version changes this value.
    pub fn packed_transformation_version(&self, stage: usize) -> String {
        let mut packed = String::new();
        for (position, index) in self.transformation_path(stage).into_iter().enumerate() {
            let upstream = &self.stages[index];
            if position > 0 {
                packed.push('+');
            }
            pack_escaped(&mut packed, &upstream.connection_name);
            packed.push('=');
            pack_escaped(&mut packed, &upstream.version);
        }
        packed
    }
}

fn pack_escaped(out: &mut String, value: &str) {
    for ch in value.chars() {
        if matches!(ch, '\\' | '+' | '=') {
            out.push('\\');
        }
        out.push(ch);
    }
}

/// A pipeline paired with the stored ledger state of one document at each output stage.
#[derive(Debug, Clone)]
pub struct PipelineSpecWithVersions {
    spec: PipelineSpec,
    stored: Vec<Option<DocumentIngestStatus>>,
}

impl PipelineSpecWithVersions {
    /// `lookup` is called once per output connection name.
    pub fn new<F>(spec: PipelineSpec, mut lookup: F) -> Self
    where
        F: FnMut(&str) -> Option<DocumentIngestStatus>,
    {
        let stored = spec
            .stages()
            .iter()
            .map(|stage| match stage.kind {
                StageKind::Output => lookup(&stage.connection_name),
                StageKind::Transformation => None,
            })
            .collect();
        Self { spec, stored }
    }

    pub fn spec(&self) -> &PipelineSpec {
        &self.spec
    }

    pub fn stored_status(&self, stage: usize) -> Option<&DocumentIngestStatus> {
        self.stored.get(stage).and_then(Option::as_ref)
    }

    /// Whether the output at `stage` lacks a delivered copy matching the new versions.
    pub fn output_needs_delivery(&self, stage: usize, versions: &DocumentVersions) -> bool {
        let Some(spec_stage) = self.spec.stage(stage) else {
            return false;
        };
        let Some(stored) = self.stored_status(stage) else {
            return true;
        };
        if stored.state == LedgerState::NeverSeen {
            return true;
        }
        let Some(stored_document_version) = stored.document_version.as_deref() else {
            return true;
        };
        if stored_document_version != versions.document_version
            || stored.parameter_version.as_deref().unwrap_or("") != versions.parameter_version
            || stored.authority_name.as_deref().unwrap_or("") != versions.authority_name
        {
            return true;
        }
        if stored.transformation_version.as_deref().unwrap_or("")
            != self.spec.packed_transformation_version(stage)
        {
            return true;
        }
        stored.output_version.as_deref().unwrap_or("") != spec_stage.version
    }

    /// True when any output stage must be (re)delivered.
    ///
    /// An empty document version means the source cannot version the document, so it is
    /// always refetched.
    pub fn needs_fetch(&self, versions: &DocumentVersions) -> bool {
        if versions.document_version.is_empty() {
            return true;
        }
        self.spec
            .output_stages()
            .any(|(index, _)| self.output_needs_delivery(index, versions))
    }
}
