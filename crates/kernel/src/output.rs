use serde_json::{Map, Value};

use crate::message::{Content, DisplayData, ErrorContent, MimeBundle, StreamName};

#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Stream {
        name: StreamName,
        text: String,
    },
    DisplayData {
        data: MimeBundle,
        metadata: Map<String, Value>,
        display_id: Option<String>,
    },
    ExecuteResult {
        data: MimeBundle,
        metadata: Map<String, Value>,
        execution_count: u32,
    },
    Error(ExecutionError),
}

impl Output {
    pub fn display_id(&self) -> Option<&str> {
        match self {
            Output::DisplayData { display_id, .. } => display_id.as_deref(),
            _ => None,
        }
    }

    /// The `text/plain` rendition, used by plain terminals.
    pub fn plain_text(&self) -> Option<String> {
        match self {
            Output::Stream { text, .. } => Some(text.clone()),
            Output::DisplayData { data, .. } | Output::ExecuteResult { data, .. } => {
                match data.get("text/plain")? {
                    Value::String(text) => Some(text.clone()),
                    Value::Array(lines) => Some(
                        lines
                            .iter()
                            .filter_map(Value::as_str)
                            .collect::<Vec<_>>()
                            .concat(),
                    ),
                    _ => None,
                }
            }
            Output::Error(error) => Some(format!("{}: {}", error.ename, error.evalue)),
        }
    }
}

/// A code failure reported by the kernel. This is data, not a fault of the session.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionError {
    pub ename: String,
    pub evalue: String,
    pub traceback: Vec<String>,
}

impl From<&ErrorContent> for ExecutionError {
    fn from(error: &ErrorContent) -> Self {
        Self {
            ename: error.ename.clone(),
            evalue: error.evalue.clone(),
            traceback: error.traceback.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    /// Fragments in arrival order, display updates applied in place.
    pub outputs: Vec<Output>,
    pub error: Option<ExecutionError>,
    /// Assigned by the kernel; `None` until the reply says otherwise.
    pub execution_count: Option<u32>,
}

impl ExecutionResult {
    /// Outputs as a renderer should show them: adjacent streams of the same
    /// name merged into one block.
    pub fn rendered(&self) -> Vec<Output> {
        let mut blocks: Vec<Output> = Vec::with_capacity(self.outputs.len());
        for output in &self.outputs {
            if let (
                Some(Output::Stream { name: last, text }),
                Output::Stream { name, text: more },
            ) = (blocks.last_mut(), output)
            {
                if last == name {
                    text.push_str(more);
                    continue;
                }
            }
            blocks.push(output.clone());
        }
        blocks
    }

    pub fn last_error(&self) -> Option<&ExecutionError> {
        self.outputs.iter().rev().find_map(|output| match output {
            Output::Error(error) => Some(error),
            _ => None,
        })
    }

    pub fn last_execute_count(&self) -> Option<u32> {
        self.outputs.iter().rev().find_map(|output| match output {
            Output::ExecuteResult {
                execution_count, ..
            } => Some(*execution_count),
            _ => None,
        })
    }
}

/// Folds iopub output fragments into an [`ExecutionResult`].
#[derive(Debug, Default)]
pub struct OutputAggregator {
    clear_pending: bool,
}

impl OutputAggregator {
    /// Applies one iopub fragment; returns `false` for content that carries no output.
    pub fn apply(&mut self, result: &mut ExecutionResult, content: &Content) -> bool {
        match content {
            Content::Stream(stream) => self.push(
                result,
                Output::Stream {
                    name: stream.name,
                    text: stream.text.clone(),
                },
            ),
            Content::DisplayData(display) | Content::UpdateDisplayData(display) => {
                self.display(result, display)
            }
            Content::ExecuteResult(execute_result) => self.push(
                result,
                Output::ExecuteResult {
                    data: execute_result.data.clone(),
                    metadata: execute_result.metadata.clone(),
                    execution_count: execute_result.execution_count,
                },
            ),
            Content::Error(error) => self.push(result, Output::Error(error.into())),
            Content::ClearOutput(clear) => {
                if clear.wait {
                    self.clear_pending = true;
                } else {
                    result.outputs.clear();
                    self.clear_pending = false;
                }
            }
            _ => return false,
        }
        true
    }

    fn push(&mut self, result: &mut ExecutionResult, output: Output) {
        self.flush_clear(result);
        result.outputs.push(output);
    }

    fn display(&mut self, result: &mut ExecutionResult, display: &DisplayData) {
        self.flush_clear(result);

        let output = Output::DisplayData {
            data: display.data.clone(),
            metadata: display.metadata.clone(),
            display_id: display.display_id().map(str::to_string),
        };

        let existing = display.display_id().and_then(|id| {
            result
                .outputs
                .iter()
                .rposition(|output| output.display_id() == Some(id))
        });
        match existing {
            Some(index) => result.outputs[index] = output,
            None => result.outputs.push(output),
        }
    }

    fn flush_clear(&mut self, result: &mut ExecutionResult) {
        if self.clear_pending {
            result.outputs.clear();
            self.clear_pending = false;
        }
    }
}
