//! The `cache_check` walk.
//!
//! Guards first (file kind and size, XML-dump probe on raw bytes; no
//! block manager is opened for an undersized file), then the superblock,
//! then each enabled substructure. Damage is reported through the
//! per-structure visitors and folded into one [`ErrorState`]; structural
//! progress goes to the trace log, the diagnostic stream carries only
//! damage.

use crate::error_state::{ErrorState, combine_errors};
use crate::nested_output::NestedOutput;
use cmeta_block::{BlockManager, device_length};
use cmeta_cache::{
    HintArray, HintDamage, HintVisitor, MappingArray, MappingDamage, MappingVisitor,
    METADATA_CACHE_SIZE, MetadataVersion, Superblock, SuperblockDamage, SuperblockVisitor,
    check_mapping_array, check_superblock, read_superblock,
};
use cmeta_error::Result;
use cmeta_pdata::{
    Bitset, BitsetVisitor, SpaceMap, SpaceMapRoot, TransactionManager, open_space_map,
    space_map_pages,
};
use cmeta_types::{BlockAddress, KeyRange, MD_BLOCK_SIZE};
use parking_lot::Mutex;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Marker the human-readable dump format starts with.
const XML_MARKER: &[u8] = b"<superblock";

#[derive(Debug, Clone)]
pub struct CheckOptions {
    pub check_mappings: bool,
    pub check_hints: bool,
    pub check_discards: bool,
    pub ignore_non_fatal: bool,
    pub quiet: bool,
    pub clear_needs_check: bool,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            check_mappings: true,
            check_hints: true,
            check_discards: true,
            ignore_non_fatal: false,
            quiet: false,
            clear_needs_check: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CheckOutcome {
    pub error: ErrorState,
    pub needs_check_set: bool,
}

/// Whether the accumulated state counts as success under `opts`.
#[must_use]
pub fn check_succeeded(opts: &CheckOptions, error: ErrorState) -> bool {
    if opts.ignore_non_fatal {
        error != ErrorState::Fatal
    } else {
        error == ErrorState::NoError
    }
}

/// Process exit code for an outcome.
#[must_use]
pub fn exit_code(opts: &CheckOptions, error: ErrorState) -> i32 {
    if check_succeeded(opts, error) { 0 } else { 1 }
}

// ── Reporters ───────────────────────────────────────────────────────────────

struct Reporter<'a, 'w> {
    out: &'a mut NestedOutput<'w>,
    err: ErrorState,
}

impl<'a, 'w> Reporter<'a, 'w> {
    fn new(out: &'a mut NestedOutput<'w>) -> Self {
        Self {
            out,
            err: ErrorState::NoError,
        }
    }

    fn mplus_error(&mut self, err: ErrorState) {
        self.err = combine_errors(self.err, err);
    }

    fn nested(&mut self, headline: &str, detail: &str) {
        self.out.line(headline);
        self.out.push();
        self.out.line(detail);
        self.out.pop();
    }
}

impl SuperblockVisitor for Reporter<'_, '_> {
    fn visit(&mut self, damage: &SuperblockDamage) {
        match damage {
            SuperblockDamage::Corrupt { desc } => self.nested("superblock is corrupt", desc),
            SuperblockDamage::Invalid { desc } => self.nested("superblock is invalid", desc),
        }
        self.mplus_error(ErrorState::Fatal);
    }
}

impl MappingVisitor for Reporter<'_, '_> {
    fn visit(&mut self, damage: &MappingDamage) {
        match damage {
            MappingDamage::Missing { keys, desc } => {
                self.nested(&format!("missing mappings {keys}:"), desc);
            }
            MappingDamage::Invalid {
                cblock,
                mapping,
                desc,
            } => {
                self.nested(
                    "invalid mapping:",
                    &format!(
                        "{desc} [cblock = {cblock}, oblock = {}, flags = {}]",
                        mapping.oblock, mapping.flags
                    ),
                );
            }
        }
        self.mplus_error(ErrorState::Fatal);
    }
}

impl HintVisitor for Reporter<'_, '_> {
    fn visit(&mut self, damage: &HintDamage) {
        let HintDamage::Missing { keys, desc } = damage;
        self.nested(&format!("missing hints {keys}:"), desc);
        self.mplus_error(ErrorState::Fatal);
    }
}

/// Bitset reporter, labelled by which bitset it walks.
struct BitsetReporter<'a, 'w> {
    inner: Reporter<'a, 'w>,
    label: &'static str,
}

impl BitsetVisitor for BitsetReporter<'_, '_> {
    fn bit(&mut self, _index: u64, _value: bool) {}

    fn missing(&mut self, keys: KeyRange) {
        self.inner.out.line(&format!("missing {} bits {keys}", self.label));
        self.inner.mplus_error(ErrorState::Fatal);
    }
}

// ── Guards ──────────────────────────────────────────────────────────────────

fn looks_like_xml(path: &Path) -> bool {
    let Ok(file) = std::fs::File::open(path) else {
        return false;
    };
    let mut head = Vec::with_capacity(MD_BLOCK_SIZE);
    if file.take(MD_BLOCK_SIZE as u64).read_to_end(&mut head).is_err() {
        return false;
    }
    head.windows(XML_MARKER.len())
        .any(|window| window == XML_MARKER)
}

// ── The walk ────────────────────────────────────────────────────────────────

/// Check the metadata at `path`, writing damage reports to `out`.
pub fn metadata_check(
    path: &Path,
    opts: &CheckOptions,
    out: &mut NestedOutput<'_>,
) -> Result<CheckOutcome> {
    let fatal = CheckOutcome {
        error: ErrorState::Fatal,
        needs_check_set: false,
    };

    if device_length(path)? < MD_BLOCK_SIZE as u64 {
        if looks_like_xml(path) {
            out.line("This looks like XML.  cache_check only checks the binary metadata format.");
        } else {
            out.line("Metadata device/file too small.  Is this binary metadata?");
        }
        return Ok(fatal);
    }

    let bm = Arc::new(BlockManager::open(path, METADATA_CACHE_SIZE, false)?);

    debug!(event = "examining_superblock");
    let sb_err = {
        let mut reporter = Reporter::new(out);
        check_superblock(&bm, bm.get_nr_blocks(), &mut reporter);
        reporter.err
    };
    if sb_err == ErrorState::Fatal {
        if looks_like_xml(path) {
            out.line("This looks like XML.  cache_check only checks the binary metadata format.");
        }
        return Ok(fatal);
    }

    let sb = read_superblock(&bm)?;
    let version = MetadataVersion::from_raw(sb.version)?;
    let needs_check_set = sb.needs_check();

    let sm = SpaceMap::new(bm.get_nr_blocks());
    let tm = TransactionManager::new(Arc::clone(&bm), Arc::new(Mutex::new(sm)));

    let mut err = sb_err;

    if opts.check_mappings {
        debug!(event = "examining_mapping_array", cache_blocks = sb.cache_blocks);
        let ma = MappingArray::open(&tm, sb.mapping_root, sb.cache_blocks);
        let mut reporter = Reporter::new(out);
        check_mapping_array(&ma, &mut reporter, version);
        err = combine_errors(err, reporter.err);

        if version >= MetadataVersion::V2
            && let Some(dirty_root) = sb.dirty_root
        {
            debug!(event = "examining_dirty_bitset");
            let bits = Bitset::open(&tm, dirty_root, sb.cache_blocks);
            let mut reporter = BitsetReporter {
                inner: Reporter::new(out),
                label: "dirty",
            };
            bits.walk(&mut reporter);
            err = combine_errors(err, reporter.inner.err);
        }
    }

    if opts.check_hints {
        match sb.hint_root {
            None => debug!(event = "no_hint_array"),
            Some(root) => {
                debug!(event = "examining_hint_array", width = sb.policy_hint_size);
                let ha = HintArray::open(&tm, root, sb.policy_hint_size, sb.cache_blocks)?;
                let mut reporter = Reporter::new(out);
                ha.check(&mut reporter);
                err = combine_errors(err, reporter.err);
            }
        }
    }

    if opts.check_discards {
        match sb.discard_root {
            None => debug!(event = "no_discard_bitset"),
            Some(root) => {
                debug!(
                    event = "examining_discard_bitset",
                    nr_blocks = sb.discard_nr_blocks
                );
                let bits = Bitset::open(&tm, root, sb.discard_nr_blocks);
                let mut reporter = BitsetReporter {
                    inner: Reporter::new(out),
                    label: "discard",
                };
                bits.walk(&mut reporter);
                err = combine_errors(err, reporter.inner.err);
            }
        }
    }

    // The audit needs the full reachable set, so it only runs when every
    // substructure walk is enabled.
    if opts.check_mappings && opts.check_hints && opts.check_discards {
        debug!(event = "examining_space_map");
        err = combine_errors(err, space_map_audit(&bm, &tm, &sb, out));
    }

    Ok(CheckOutcome {
        error: err,
        needs_check_set,
    })
}

/// Recount every block reachable from the superblock roots and compare
/// with the on-disk space map. Mismatches are non-fatal.
fn space_map_audit(
    bm: &BlockManager,
    tm: &TransactionManager,
    sb: &Superblock,
    out: &mut NestedOutput<'_>,
) -> ErrorState {
    let Ok(sm_root) = SpaceMapRoot::decode(&sb.space_map_root) else {
        out.line("space map root unreadable");
        return ErrorState::NonFatal;
    };
    if !sm_root.is_present() {
        out.line("space map missing from superblock");
        return ErrorState::NonFatal;
    }
    let on_disk = match open_space_map(bm, &sm_root) {
        Ok(sm) => sm,
        Err(e) => {
            out.line(&format!("space map unreadable: {e}"));
            return ErrorState::NonFatal;
        }
    };

    let mut reachable: Vec<BlockAddress> = vec![cmeta_types::SUPERBLOCK_LOCATION];
    let mut extend = |pages: Result<Vec<BlockAddress>>| {
        // Unreadable structures were already reported by their own walk.
        if let Ok(pages) = pages {
            reachable.extend(pages);
        }
    };

    extend(MappingArray::open(tm, sb.mapping_root, sb.cache_blocks).page_addresses());
    if let Some(root) = sb.hint_root
        && let Ok(ha) = HintArray::open(tm, root, sb.policy_hint_size, sb.cache_blocks)
    {
        extend(ha.page_addresses());
    }
    if let Some(root) = sb.discard_root {
        extend(Bitset::open(tm, root, sb.discard_nr_blocks).page_addresses());
    }
    if let Some(root) = sb.dirty_root {
        extend(Bitset::open(tm, root, sb.cache_blocks).page_addresses());
    }
    extend(space_map_pages(bm, &sm_root));

    let mut expected = vec![0_u32; bm.get_nr_blocks() as usize];
    for block in reachable {
        if let Some(count) = expected.get_mut(block.0 as usize) {
            *count += 1;
        }
    }

    let mut err = ErrorState::NoError;
    for (block, expected_count) in expected.iter().enumerate() {
        let actual = on_disk
            .get(BlockAddress(block as u64))
            .unwrap_or_default();
        if actual != *expected_count {
            out.line(&format!(
                "space map mismatch at block {block}: expected {expected_count}, actual {actual}"
            ));
            err = ErrorState::NonFatal;
        }
    }
    err
}

/// Full checker entry point: guards, walk, optional needs-check clearing.
pub fn run_cache_check(
    path: &Path,
    opts: &CheckOptions,
    sink: &mut dyn std::io::Write,
) -> Result<CheckOutcome> {
    let mut out = NestedOutput::new(sink, 2);
    if opts.quiet {
        out.disable();
    }

    let outcome = metadata_check(path, opts, &mut out)?;

    if opts.clear_needs_check
        && outcome.needs_check_set
        && check_succeeded(opts, outcome.error)
    {
        cmeta_cache::clear_needs_check(path)?;
    }
    Ok(outcome)
}
