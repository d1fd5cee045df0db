// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Engine deployment parameters.
//!
//! The engine build emits a parameter file with one `(KEY,VALUE)` pair per
//! line. Test doubles and tooling size themselves from it; the runtime proper
//! only needs the transaction-table depth and the block encoding, which it
//! learns from the engine's capability word.

use log::warn;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParamError {
    /// Line |n| (1-based) is not of the form `(KEY,VALUE)`.
    MalformedLine(usize),
    /// Line |n| carries a value that is not a non-negative integer.
    BadValue(usize),
    /// The named parameter does not fit the engine's capability word.
    OutOfRange(&'static str),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EngineParams {
    pub num_pes: usize,
    pub cache_entries: usize,
    pub elements_per_block: usize,
    /// K, the number of transactions the engine can hold at once.
    pub transaction_table_entries: usize,
    pub transaction_table_sram_elements: usize,
    pub register_file_elements: usize,
    pub asid_width: u32,
    pub tid_width: u32,
    pub nnid_width: u32,
    pub feedback_width: u32,
    pub element_width: u32,
    pub num_cores: usize,
    pub decimal_point_offset: u32,
    pub decimal_point_width: u32,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            num_pes: 4,
            cache_entries: 4,
            elements_per_block: 4,
            transaction_table_entries: 4,
            transaction_table_sram_elements: 64,
            register_file_elements: 64,
            asid_width: 10,
            tid_width: 16,
            nnid_width: 32,
            feedback_width: 16,
            element_width: 32,
            num_cores: 1,
            decimal_point_offset: 7,
            decimal_point_width: 3,
        }
    }
}

impl EngineParams {
    /// Parses a parameter file, starting from the defaults. Unknown keys are
    /// reported and skipped so newer engine builds stay loadable.
    pub fn parse(text: &str) -> Result<Self, ParamError> {
        let mut params = EngineParams::default();
        for (index, line) in text.lines().enumerate() {
            let lineno = index + 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .strip_prefix('(')
                .and_then(|l| l.strip_suffix(')'))
                .and_then(|l| l.split_once(','))
                .ok_or(ParamError::MalformedLine(lineno))?;
            let value: u64 = value
                .trim()
                .parse()
                .map_err(|_| ParamError::BadValue(lineno))?;
            params.set(key.trim(), value, lineno)?;
        }
        params.validate()?;
        Ok(params)
    }

    /// Checks the fields reported through the capability word against
    /// that word's field widths.
    pub fn validate(&self) -> Result<(), ParamError> {
        let limits = [
            ("ELEMENTS_PER_BLOCK", self.elements_per_block, u8::MAX as usize),
            ("NUM_PES", self.num_pes, u16::MAX as usize),
            ("CACHE_NUM_ENTRIES", self.cache_entries, u16::MAX as usize),
            ("TRANSACTION_TABLE_NUM_ENTRIES", self.transaction_table_entries, u16::MAX as usize),
        ];
        match limits.iter().find(|(_, value, max)| value > max) {
            Some((key, value, _)) => {
                warn!("{} = {} does not fit the capability word", key, value);
                Err(ParamError::OutOfRange(*key))
            }
            None => Ok(()),
        }
    }

    fn set(&mut self, key: &str, value: u64, lineno: usize) -> Result<(), ParamError> {
        let as_usize = || usize::try_from(value).map_err(|_| ParamError::BadValue(lineno));
        let as_u32 = || u32::try_from(value).map_err(|_| ParamError::BadValue(lineno));
        match key {
            "NUM_PES" => self.num_pes = as_usize()?,
            "CACHE_NUM_ENTRIES" => self.cache_entries = as_usize()?,
            "ELEMENTS_PER_BLOCK" => self.elements_per_block = as_usize()?,
            "TRANSACTION_TABLE_NUM_ENTRIES" => self.transaction_table_entries = as_usize()?,
            "TRANSACTION_TABLE_SRAM_ELEMENTS" => {
                self.transaction_table_sram_elements = as_usize()?
            }
            "REGISTER_FILE_NUM_ELEMENTS" => self.register_file_elements = as_usize()?,
            "ASID_WIDTH" => self.asid_width = as_u32()?,
            "TID_WIDTH" => self.tid_width = as_u32()?,
            "NNID_WIDTH" => self.nnid_width = as_u32()?,
            "FEEDBACK_WIDTH" => self.feedback_width = as_u32()?,
            "ELEMENT_WIDTH" => self.element_width = as_u32()?,
            "NUM_CORES" => self.num_cores = as_usize()?,
            "DECIMAL_POINT_OFFSET" => self.decimal_point_offset = as_u32()?,
            "DECIMAL_POINT_WIDTH" => self.decimal_point_width = as_u32()?,
            _ => warn!("Unknown engine parameter {} on line {}; skipped", key, lineno),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_file() {
        let text = "(NUM_PES,8)\n\
                    (CACHE_NUM_ENTRIES,2)\n\
                    (ELEMENTS_PER_BLOCK,8)\n\
                    (TRANSACTION_TABLE_NUM_ENTRIES,6)\n\
                    (DECIMAL_POINT_OFFSET,7)\n";
        let params = EngineParams::parse(text).unwrap();
        assert_eq!(params.num_pes, 8);
        assert_eq!(params.cache_entries, 2);
        assert_eq!(params.elements_per_block, 8);
        assert_eq!(params.transaction_table_entries, 6);
        // Untouched keys keep their defaults.
        assert_eq!(params.tid_width, EngineParams::default().tid_width);
    }

    #[test]
    fn unknown_keys_are_skipped() {
        let params = EngineParams::parse("(FROBNICATE,3)\n\n(NUM_CORES, 2)\n").unwrap();
        assert_eq!(params.num_cores, 2);
    }

    #[test]
    fn malformed_lines() {
        assert_eq!(
            EngineParams::parse("(NUM_PES,4)\nNUM_PES=4\n"),
            Err(ParamError::MalformedLine(2))
        );
        assert_eq!(EngineParams::parse("(NUM_PES,-1)"), Err(ParamError::BadValue(1)));
        assert_eq!(EngineParams::parse("(TID_WIDTH,99999999999)"), Err(ParamError::BadValue(1)));
    }

    #[test]
    fn capability_fields_are_range_checked() {
        assert_eq!(
            EngineParams::parse("(ELEMENTS_PER_BLOCK,256)"),
            Err(ParamError::OutOfRange("ELEMENTS_PER_BLOCK"))
        );
        assert_eq!(
            EngineParams::parse("(TRANSACTION_TABLE_NUM_ENTRIES,65536)"),
            Err(ParamError::OutOfRange("TRANSACTION_TABLE_NUM_ENTRIES"))
        );
        let params = EngineParams::parse("(ELEMENTS_PER_BLOCK,255)\n(TRANSACTION_TABLE_NUM_ENTRIES,65535)").unwrap();
        assert_eq!(params.validate(), Ok(()));
    }
}
