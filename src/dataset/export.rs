use std::io::Write;

use serde::Serialize;

use super::TrainingExample;
use crate::error::Result;

#[derive(Serialize)]
struct InstructionRecord<'a> {
    instruction: &'a str,
    input: &'a str,
    output: &'a str,
}

/// One `TrainingExample` per line.
pub fn write_records<W: Write>(examples: &[TrainingExample], mut out: W) -> Result<()> {
    for example in examples {
        serde_json::to_writer(&mut out, example)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

/// `{instruction, input, output}` lines for instruction tuning.
pub fn write_instructions<W: Write>(examples: &[TrainingExample], mut out: W) -> Result<()> {
    for example in examples {
        let record = InstructionRecord {
            instruction: example.category.instruction(),
            input: &example.input,
            output: &example.output,
        };
        serde_json::to_writer(&mut out, &record)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}
