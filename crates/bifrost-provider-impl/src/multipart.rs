use bytes::Bytes;

/// Transport-agnostic description of a multipart/form-data upload. Adapters
/// build this; the wreq client turns it into a `wreq::multipart::Form` at
/// send time, so fakes in tests can still inspect the parts.
#[derive(Debug, Clone, Default)]
pub struct MultipartForm {
    parts: Vec<MultipartPart>,
}

#[derive(Debug, Clone)]
pub enum MultipartPart {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        file_name: String,
        content_type: String,
        data: Bytes,
    },
}

impl MultipartForm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: &str, value: &str) -> Self {
        self.parts.push(MultipartPart::Text {
            name: name.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub fn file(
        mut self,
        name: &str,
        file_name: &str,
        content_type: &str,
        data: impl Into<Bytes>,
    ) -> Self {
        self.parts.push(MultipartPart::File {
            name: name.to_string(),
            file_name: file_name.to_string(),
            content_type: content_type.to_string(),
            data: data.into(),
        });
        self
    }

    pub fn parts(&self) -> &[MultipartPart] {
        &self.parts
    }

    /// Encodes into wreq's multipart form; the boundary and part framing
    /// come from wreq. Fails only on an unparseable content type.
    pub(crate) fn into_wreq(self) -> Result<wreq::multipart::Form, wreq::Error> {
        let mut form = wreq::multipart::Form::new();
        for part in self.parts {
            form = match part {
                MultipartPart::Text { name, value } => form.text(name, value),
                MultipartPart::File { name, file_name, content_type, data } => {
                    let part = wreq::multipart::Part::bytes(data.to_vec())
                        .file_name(file_name)
                        .mime_str(&content_type)?;
                    form.part(name, part)
                }
            };
        }
        Ok(form)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_parts_in_order() {
        let form = MultipartForm::new()
            .text("model", "whisper-1")
            .file("file", "clip.wav", "audio/wav", b"RIFF".as_slice());

        let parts = form.parts();
        assert_eq!(parts.len(), 2);
        assert!(matches!(
            &parts[0],
            MultipartPart::Text { name, value } if name == "model" && value == "whisper-1"
        ));
        assert!(matches!(
            &parts[1],
            MultipartPart::File { file_name, content_type, data, .. }
                if file_name == "clip.wav" && content_type == "audio/wav" && data.as_ref() == b"RIFF"
        ));
    }

    #[test]
    fn encodes_through_wreq() {
        let form = MultipartForm::new()
            .text("purpose", "batch")
            .file("file", "rows.jsonl", "application/jsonl", b"{}".as_slice());
        assert!(form.into_wreq().is_ok());

        let broken = MultipartForm::new().file("file", "x", "not a mime type", b"".as_slice());
        assert!(broken.into_wreq().is_err());
    }
}
