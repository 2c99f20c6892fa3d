//! The paginated metadata scan used by peer bootstrap and repair: a
//! two-phase walk over in-memory entries, then over flushed filesets.
//!
//! The scan works backwards through flushed blocks so a flush racing the
//! pagination cannot hide data between pages. The cost is possible
//! duplicates across the active-to-flushed transition, which consumers
//! dedupe; missed data would be unrecoverable, duplicates are not.

use crate::error::{Result, ShardError};
use crate::fileset::ReaderPosition;
use crate::series::{BlockMetadata, SeriesBlocksMetadata};
use crate::shard::{now_nanos, Shard};
use crate::types::Timestamp;
use serde::{Deserialize, Serialize};
use tracing::error;

/// Cursor of the in-memory phase: entries with a unique index below the
/// cursor have already been returned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivePhase {
    pub index_cursor: u64,
}

/// Cursor of the on-disk phase: the block being read, how many metadata
/// records of it were consumed, and the volume they came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushedPhase {
    pub curr_block_start: Timestamp,
    pub curr_block_entry_idx: i64,
    pub volume: i32,
}

/// Page token of [`Shard::fetch_blocks_metadata_v2`], serialized as a
/// length-delimited record with two optional phases. Presence of `flushed`
/// implies the active phase is complete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageToken {
    pub active: Option<ActivePhase>,
    pub flushed: Option<FlushedPhase>,
}

impl PageToken {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| ShardError::Serialization(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|_| ShardError::InvalidPageToken)
    }
}

/// Options for the metadata scan.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchBlocksMetadataOptions {
    pub include_sizes: bool,
    pub include_checksums: bool,
    /// Skip the in-memory phase entirely and serve from disk only.
    pub only_disk: bool,
}

/// One page of metadata results plus the token for the next page. A `None`
/// token means the scan is complete.
#[derive(Debug)]
pub struct FetchBlocksMetadataResult {
    pub results: Vec<SeriesBlocksMetadata>,
    pub next_token: Option<Vec<u8>>,
}

impl Shard {
    /// Pages through the metadata of every series with data in
    /// `[start, end)`: first the in-memory entries in insertion order, then
    /// the flushed filesets newest-block-first.
    pub fn fetch_blocks_metadata_v2(
        &self,
        start: Timestamp,
        end: Timestamp,
        limit: i64,
        page_token: Option<&[u8]>,
        opts: FetchBlocksMetadataOptions,
    ) -> Result<FetchBlocksMetadataResult> {
        let token = match page_token {
            Some(data) => PageToken::decode(data)?,
            None => PageToken {
                active: None,
                flushed: opts.only_disk.then(FlushedPhase::default),
            },
        };

        if token.flushed.is_none() {
            let index_cursor = token.active.map(|a| a.index_cursor).unwrap_or(0);
            let (results, next_index_cursor) =
                self.fetch_active_blocks_metadata(start, end, limit, index_cursor)?;

            let next_token = match next_index_cursor {
                // This phase is still active.
                Some(cursor) => PageToken {
                    active: Some(ActivePhase { index_cursor: cursor }),
                    flushed: None,
                },
                // No more results from active series; next page starts the
                // flushed phase.
                None => PageToken {
                    active: None,
                    flushed: Some(FlushedPhase::default()),
                },
            };
            return Ok(FetchBlocksMetadataResult {
                results,
                next_token: Some(next_token.encode()?),
            });
        }

        self.fetch_flushed_blocks_metadata(start, end, limit, token.flushed.unwrap(), opts)
    }

    fn fetch_active_blocks_metadata(
        &self,
        start: Timestamp,
        end: Timestamp,
        limit: i64,
        index_cursor: u64,
    ) -> Result<(Vec<SeriesBlocksMetadata>, Option<u64>)> {
        let mut results: Vec<SeriesBlocksMetadata> = Vec::new();
        let mut next_index_cursor = None;
        let mut loop_err: Option<ShardError> = None;

        self.for_each_entry(|entry| {
            // Enough accumulated; resume from this entry next page.
            if results.len() as i64 >= limit {
                next_index_cursor = Some(entry.unique_index());
                return false;
            }
            // Fast forward past indexes below the page token.
            if entry.unique_index() < index_cursor {
                return true;
            }
            match entry.series().fetch_blocks_metadata(start, end) {
                Ok(metadata) => {
                    // Series with no blocks in range are not returned.
                    if !metadata.blocks.is_empty() {
                        results.push(metadata);
                    }
                    true
                }
                Err(err) => {
                    loop_err = Some(err);
                    false
                }
            }
        });

        if let Some(err) = loop_err {
            return Err(err);
        }
        Ok((results, next_index_cursor))
    }

    fn fetch_flushed_blocks_metadata(
        &self,
        start: Timestamp,
        end: Timestamp,
        limit: i64,
        phase: FlushedPhase,
        opts: FetchBlocksMetadataOptions,
    ) -> Result<FetchBlocksMetadataResult> {
        let ropts = &self.config.retention;
        let block_size = ropts.block_size.as_nanos() as i64;
        // All fetch requests are exclusive of `end`, hence one block back.
        let mut block_start = ropts.block_start(end) - block_size;
        let earliest = ropts.flush_time_start(now_nanos());

        let mut token_block_start = None;
        if phase.curr_block_start > 0 {
            token_block_start = Some(phase.curr_block_start);
            block_start = phase.curr_block_start;
        }

        let mut results: Vec<SeriesBlocksMetadata> = Vec::new();
        let mut num_results: i64 = 0;

        // Work backwards while in the requested range and not before the
        // retention horizon.
        while block_start >= start && block_start >= earliest {
            let exists = self
                .collab
                .reader_manager
                .fileset_exists_at(self.config.shard_id, block_start)?;
            if !exists {
                block_start -= block_size;
                continue;
            }

            let mut position = ReaderPosition::default();
            if let Some(expected) = token_block_start.take() {
                // We were mid-way through a block; if the block we found is
                // a different one, the fileset went missing underneath the
                // pagination.
                if block_start != expected {
                    return Err(ShardError::internal(format!(
                        "was reading block at {} but next available block is: {}",
                        expected, block_start
                    )));
                }
                position = ReaderPosition {
                    metadata_idx: phase.curr_block_entry_idx,
                    volume: phase.volume,
                };
            }

            let mut reader =
                self.collab
                    .reader_manager
                    .get(self.config.shard_id, block_start, position)?;

            while num_results < limit {
                let entry = match reader.read_metadata() {
                    // Clean end of volume.
                    Ok(None) => break,
                    Ok(Some(entry)) => entry,
                    Err(err) => {
                        error!(
                            block_start,
                            error = %err,
                            "could not read metadata for block"
                        );
                        return Err(err);
                    }
                };

                results.push(SeriesBlocksMetadata {
                    id: entry.id,
                    tags: entry.tags,
                    blocks: vec![BlockMetadata {
                        start: block_start,
                        size: if opts.include_sizes { entry.size } else { 0 },
                        checksum: if opts.include_checksums {
                            entry.checksum
                        } else {
                            None
                        },
                    }],
                });
                num_results += 1;
            }

            let end_position = reader.metadata_read();
            // The reader's volume may differ from the token's if a cold
            // flush advanced it between pages; recording the stale volume
            // would make the next request start over and loop forever.
            let volume = reader.volume();

            // The reader goes back into a shared cache; do not touch it
            // after this call.
            self.collab.reader_manager.put(reader)?;

            if num_results >= limit {
                let next_token = PageToken {
                    active: None,
                    flushed: Some(FlushedPhase {
                        curr_block_start: block_start,
                        curr_block_entry_idx: end_position,
                        volume,
                    }),
                };
                return Ok(FetchBlocksMetadataResult {
                    results,
                    next_token: Some(next_token.encode()?),
                });
            }

            block_start -= block_size;
        }

        // No more results.
        Ok(FetchBlocksMetadataResult {
            results,
            next_token: None,
        })
    }
}
