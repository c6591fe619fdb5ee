//! Writing the streamed answer to the terminal.

use crate::fence::{FenceFilter, OutputMode};
use crate::llm::ChatStream;
use anyhow::{Context, Result};
use std::io::{self, Write};
use tracing::debug;

/// Sends filtered fragments to a writer as soon as they are available.
#[derive(Debug)]
pub struct Renderer<W: Write> {
    filter: FenceFilter,
    out: W,
}

impl<W: Write> Renderer<W> {
    pub fn new(mode: OutputMode, out: W) -> Self {
        Self {
            filter: FenceFilter::new(mode),
            out,
        }
    }

    /// Pass one fragment through the filter and write what comes out.
    pub fn write_fragment(&mut self, fragment: &str) -> io::Result<()> {
        let text = self.filter.push(fragment);
        if !text.is_empty() {
            self.out.write_all(text.as_bytes())?;
            self.out.flush()?;
        }
        Ok(())
    }

    /// Write the held-back tail and the final newline, returning the writer.
    pub fn finish(self) -> io::Result<W> {
        let Self { filter, mut out } = self;
        out.write_all(filter.finish().as_bytes())?;
        out.flush()?;
        Ok(out)
    }
}

/// Drain `stream` into `renderer` until the answer is complete.
pub async fn render_stream<W: Write>(
    stream: &mut ChatStream,
    mut renderer: Renderer<W>,
) -> Result<W> {
    let mut fragments = 0usize;
    while let Some(fragment) = stream.next_fragment().await? {
        renderer
            .write_fragment(&fragment)
            .context("Failed to write answer")?;
        fragments += 1;
    }
    debug!(fragments, "answer stream finished");
    renderer.finish().context("Failed to write answer")
}
