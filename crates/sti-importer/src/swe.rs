//! Decoder for SWE Common `DataArray` blocks with a `TextEncoding`
//!
//! A data array carries a header (element count, field names with units,
//! separators) and one values string:
//!
//! ```text
//! decimal ","  block ";"  token ":"
//! fields  StartTime, Value
//! values  "10:5,2;20:5,3;"
//! ```
//!
//! [`SweDecoder`] walks the blocks one at a time and exposes each block as a
//! [`DecodedRecord`] keyed by field name. Numeric fields have the decimal
//! separator normalised to `.`. The record borrows the decoder's buffers, so
//! it cannot outlive the next call to [`SweDecoder::next_record`].

use crate::error::{ImportError, Result};
use crate::xml::Element;
use std::collections::HashMap;
use std::ops::Range;

/// Separators of a `swe:TextEncoding`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEncoding {
    pub decimal_separator: String,
    pub block_separator: String,
    pub token_separator: String,
}

impl TextEncoding {
    pub fn new(decimal: &str, block: &str, token: &str) -> Self {
        Self {
            decimal_separator: decimal.to_string(),
            block_separator: block.to_string(),
            token_separator: token.to_string(),
        }
    }
}

/// A field of the array's element type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    /// Unit reference (`swe:uom/@xlink:href`), when the field has one
    pub uom: Option<String>,
}

/// Header and payload of one data array
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataArray {
    pub element_count: usize,
    pub encoding: TextEncoding,
    pub fields: Vec<FieldDescriptor>,
    pub values: String,
}

impl DataArray {
    /// Read a `swe:DataArray` element
    pub fn from_element(array: &Element) -> Result<Self> {
        let count_text = array.value("elementCount/Count/value");
        let element_count = count_text.trim().parse::<usize>().map_err(|_| {
            ImportError::format(format!("Invalid data array element count '{}'", count_text))
        })?;

        let encoding_element = array
            .find("encoding/TextEncoding")
            .ok_or_else(|| ImportError::format("Data array has no TextEncoding"))?;
        let separator = |name: &str| -> Result<String> {
            match encoding_element.attr(name) {
                Some(value) if !value.is_empty() => Ok(value.to_string()),
                _ => Err(ImportError::format(format!("TextEncoding without {}", name))),
            }
        };
        let encoding = TextEncoding {
            decimal_separator: separator("decimalSeparator")?,
            block_separator: separator("blockSeparator")?,
            token_separator: separator("tokenSeparator")?,
        };

        let fields: Vec<FieldDescriptor> = array
            .find_all("elementType/DataRecord/field")
            .into_iter()
            .map(|field| FieldDescriptor {
                name: field.attr("name").unwrap_or_default().to_string(),
                uom: field
                    .descendant("uom")
                    .and_then(|uom| uom.attr("href"))
                    .map(str::to_string),
            })
            .collect();
        if fields.is_empty() {
            return Err(ImportError::format("Data array declares no fields"));
        }

        Ok(Self {
            element_count,
            encoding,
            fields,
            values: array.value("values"),
        })
    }

    /// Find the first `DataArray` in a document (the root itself included)
    pub fn find_in(root: &Element) -> Result<Self> {
        let array = if root.name == "DataArray" {
            root
        } else {
            root.descendant("DataArray")
                .ok_or_else(|| ImportError::format("Document contains no DataArray"))?
        };
        Self::from_element(array)
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A field a consumer wants decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub numeric: bool,
}

impl FieldSpec {
    pub fn text(name: &str) -> Self {
        Self {
            name: name.to_string(),
            numeric: false,
        }
    }

    pub fn numeric(name: &str) -> Self {
        Self {
            name: name.to_string(),
            numeric: true,
        }
    }
}

/// Streaming decoder over the blocks of a [`DataArray`]
#[derive(Debug)]
pub struct SweDecoder {
    array: DataArray,
    /// Header column of each configured field
    slots: HashMap<String, usize>,
    /// Per header column, whether its decimal separator is normalised
    numeric: Vec<bool>,
    values: Vec<String>,
    blocks: Vec<Range<usize>>,
    cursor: usize,
}

impl SweDecoder {
    pub fn new(array: DataArray) -> Self {
        Self {
            array,
            slots: HashMap::new(),
            numeric: Vec::new(),
            values: Vec::new(),
            blocks: Vec::new(),
            cursor: 0,
        }
    }

    /// Select the fields to decode
    ///
    /// Names not present in the header are kept and read back as absent.
    pub fn configure(&mut self, fields: &[FieldSpec]) {
        self.slots.clear();
        self.numeric = vec![false; self.array.fields.len()];
        for spec in fields {
            if let Some(column) = self.array.fields.iter().position(|f| f.name == spec.name) {
                self.slots.insert(spec.name.clone(), column);
                self.numeric[column] |= spec.numeric;
            }
        }
        self.values = vec![String::new(); self.array.fields.len()];
    }

    /// Split the values string into blocks and validate each one
    ///
    /// Empty blocks are skipped. A block whose token count differs from the
    /// header's field count fails the whole array.
    pub fn parse(&mut self) -> Result<()> {
        let sep = self.array.encoding.block_separator.as_str();
        let values = self.array.values.as_str();
        let expected = self.array.fields.len();

        let mut blocks = Vec::new();
        let mut start = 0;
        for (index, part) in values.split(sep).enumerate() {
            let range = start..start + part.len();
            start = range.end + sep.len();
            if part.trim().is_empty() {
                continue;
            }
            let found = self.tokens(part).count();
            if found != expected {
                return Err(ImportError::format(format!(
                    "Data array block {} has {} tokens, header declares {} fields",
                    index, found, expected
                )));
            }
            blocks.push(range);
        }

        self.blocks = blocks;
        self.cursor = 0;
        Ok(())
    }

    fn tokens<'a>(&'a self, block: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        block
            .split(self.array.encoding.token_separator.as_str())
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    pub fn has_next(&self) -> bool {
        self.cursor < self.blocks.len()
    }

    /// Decode the next block
    pub fn next_record(&mut self) -> Option<DecodedRecord<'_>> {
        let range = self.blocks.get(self.cursor)?.clone();
        self.cursor += 1;

        let mut values = std::mem::take(&mut self.values);
        {
            let block = &self.array.values[range];
            let decimal = self.array.encoding.decimal_separator.as_str();

            for (column, token) in self.tokens(block).enumerate() {
                let Some(slot) = values.get_mut(column) else {
                    break;
                };
                slot.clear();
                if decimal != "." && self.numeric[column] {
                    slot.push_str(&token.replace(decimal, "."));
                } else {
                    slot.push_str(token);
                }
            }
        }
        self.values = values;

        Some(DecodedRecord { decoder: self })
    }

    /// Rewind to the first block
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Element count declared by the header
    pub fn element_count(&self) -> usize {
        self.array.element_count
    }

    /// Number of non-empty blocks found by [`SweDecoder::parse`]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn array(&self) -> &DataArray {
        &self.array
    }
}

/// View of the most recently decoded block
#[derive(Debug, Clone, Copy)]
pub struct DecodedRecord<'a> {
    decoder: &'a SweDecoder,
}

impl<'a> DecodedRecord<'a> {
    /// Value of a configured field, `None` if the field was not configured
    /// or is not in the header
    pub fn get(&self, name: &str) -> Option<&'a str> {
        let column = *self.decoder.slots.get(name)?;
        self.decoder.values.get(column).map(String::as_str)
    }
}
