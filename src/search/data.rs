//! Data-condition matcher
//!
//! Evaluates regex sequences over the directional byte buffers of one
//! stream at a time. The expensive part is variables: a regex may embed
//! values captured earlier in the same stream or captured by a prior
//! query part, and a prior part contributes one *variant* per distinct
//! captured row. Variants are pre-compiled into a tree up to a hard cap;
//! beyond the cap a union "precondition" regex cheaply rejects streams
//! before any per-variant work happens.

use crate::bitmask::LongBitmask;
use crate::index::{ConverterHandle, DataSectionReader, StreamRecord, RAW_CONVERTER};
use crate::query::DataCondition;
use crate::search::regex_analysis::{profile, RegexProfile};
use crate::search::SearchError;
use regex::bytes::{Regex, RegexBuilder};
use std::collections::{HashMap, HashSet};

/// Once the product of pre-computed variant counts reaches this limit,
/// remaining sub-queries are evaluated via on-the-fly alternation.
const MAX_PRECOMPUTED_VARIANTS: usize = 10_000;

/// Compile a pattern the way all data regexes run: byte-oriented.
pub(crate) fn compile_data_regex(pattern: &str) -> Result<Regex, SearchError> {
    RegexBuilder::new(pattern)
        .unicode(false)
        .build()
        .map_err(|e| SearchError::Regex(e.to_string()))
}

/// Escape captured bytes for literal use inside a pattern. Non-word bytes
/// become `\xHH` so the result is valid regardless of content.
pub(crate) fn quote_meta_bytes(value: &[u8]) -> String {
    let mut out = String::with_capacity(value.len());
    for &b in value {
        if b.is_ascii_alphanumeric() || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("\\x{b:02x}"));
        }
    }
    out
}

fn find_sub(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn rfind_sub(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

/// Matches of one prior query part, as consumed by later parts.
#[derive(Debug, Clone, Default)]
pub struct ResultData {
    /// Matched stream IDs in ascending order
    pub stream_ids: Vec<u64>,
    /// stream ID → index into `variable_data`
    pub variable_association: HashMap<u64, usize>,
    /// Deduplicated captured-variable rows
    pub variable_data: Vec<VariableDataEntry>,
}

/// One distinct captured-variable row of a prior part.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableDataEntry {
    /// How many matched streams map to this row
    pub uses: usize,
    /// `(name, value)` pairs, sorted, possibly several values per name
    pub data: Vec<(String, Vec<u8>)>,
}

/// Which prior-part result streams are still compatible with the current
/// candidate stream.
#[derive(Debug, Default)]
pub struct SubQueryRestrictions {
    allowed: HashMap<String, LongBitmask>,
    /// Failed variants bound to several sub-queries at once; removing any
    /// single row would over-narrow, so the combination is only recorded.
    forbidden_combos: Vec<Vec<(String, LongBitmask)>>,
}

impl SubQueryRestrictions {
    fn new(previous_results: &HashMap<String, ResultData>) -> Self {
        let allowed = previous_results
            .iter()
            .map(|(name, rd)| {
                (
                    name.clone(),
                    LongBitmask::all_below(rd.stream_ids.len() as u64),
                )
            })
            .collect();
        Self {
            allowed,
            forbidden_combos: Vec::new(),
        }
    }

    fn remove_single(&mut self, sub_query: &str, rows: &LongBitmask) {
        if let Some(mask) = self.allowed.get_mut(sub_query) {
            mask.sub(rows);
        }
    }

    fn remove_combo(&mut self, combo: Vec<(String, LongBitmask)>) {
        self.forbidden_combos.push(combo);
    }

    /// True once any sub-query has no compatible result stream left.
    pub fn any_empty(&self) -> bool {
        self.allowed.values().any(|mask| mask.is_zero())
    }

    /// Remaining allowed result-stream indices of one sub-query.
    pub fn allowed(&self, sub_query: &str) -> Option<&LongBitmask> {
        self.allowed.get(sub_query)
    }
}

/// Per-candidate-stream evaluation state.
#[derive(Debug)]
pub struct SearchContext {
    pub allowed_sub_queries: SubQueryRestrictions,
    /// Variables this stream contributes to later parts
    pub output_variables: HashMap<String, Vec<Vec<u8>>>,
}

impl SearchContext {
    pub fn new(previous_results: &HashMap<String, ResultData>) -> Self {
        Self {
            allowed_sub_queries: SubQueryRestrictions::new(previous_results),
            output_variables: HashMap::new(),
        }
    }
}

/// Where a stream's bytes come from during matching.
pub struct StreamSource<'a> {
    pub raw: &'a mut DataSectionReader,
    pub converters: &'a HashMap<String, ConverterHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Occurrence {
    condition: usize,
    element: usize,
}

/// One node of the pre-compiled variant tree.
#[derive(Clone, Default)]
struct RegexVariant {
    regex: Option<Regex>,
    profile: RegexProfile,
    child_sub_query: String,
    children: Vec<RegexVariant>,
    is_precondition: bool,
}

/// A deduplicated regex shared by identical elements, plus its tree.
struct RegexGroup {
    occurrences: Vec<Occurrence>,
    root: RegexVariant,
}

/// Distinct variable rows of one sub-query, quoted for substitution.
struct SubQueryVariableData {
    variable_index: HashMap<String, usize>,
    variable_data: Vec<SubQueryVariableValues>,
}

struct SubQueryVariableValues {
    /// Per variable (by `variable_index`) the quoted alternation text
    quoted_data: Vec<String>,
    /// Which result streams of the sub-query map to this row
    results: LongBitmask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProgressState {
    Uninitialized,
    Exact,
    Precondition,
    PreconditionMatched,
}

/// One alternative state of a condition's matching cursor.
#[derive(Clone)]
struct ProgressVariant {
    stream_offset: [usize; 2],
    n_successful: usize,
    variables: HashMap<String, Vec<u8>>,
    regex: Option<Regex>,
    profile: RegexProfile,
    variant: HashMap<String, usize>,
    state: ProgressState,
}

impl Default for ProgressVariant {
    fn default() -> Self {
        Self {
            stream_offset: [0, 0],
            n_successful: 0,
            variables: HashMap::new(),
            regex: None,
            profile: RegexProfile::default(),
            variant: HashMap::new(),
            state: ProgressState::Uninitialized,
        }
    }
}

enum StepOutcome {
    Continue,
    StreamFailed,
}

/// Collects the data conditions of one query part before compilation.
#[derive(Default)]
pub struct DataConditionsContainer {
    conditions: Vec<DataCondition>,
    regexes: Vec<RegexGroup>,
    /// sub-query name → variable names needed from it
    dependencies: HashMap<String, HashSet<String>>,
}

/// The outcome of [`DataConditionsContainer::finalize`].
pub enum CompiledConditions {
    /// No data conditions; every stream passes
    AlwaysSuccess,
    /// A required sub-query has no usable variable row; nothing passes
    AlwaysFail,
    Filter(Box<DataFilter>),
}

/// A compiled, index-independent data-condition filter.
pub struct DataFilter {
    conditions: Vec<DataCondition>,
    regexes: Vec<RegexGroup>,
    impossible_sub_queries: HashMap<String, LongBitmask>,
    possible_sub_queries: HashMap<String, SubQueryVariableData>,
    converters_to_search: Vec<String>,
}

impl DataConditionsContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one condition; all conditions must share one converter.
    pub fn add(
        &mut self,
        condition: &DataCondition,
        previous_results: &HashMap<String, ResultData>,
    ) -> Result<(), SearchError> {
        if condition.elements.is_empty() {
            return Ok(());
        }
        let converter_name = &condition.elements[0].converter_name;
        if let Some(first) = self.conditions.first() {
            if converter_name != &first.elements[0].converter_name {
                return Err(SearchError::MixedConverters);
            }
        }
        for element in &condition.elements {
            if &element.converter_name != converter_name {
                return Err(SearchError::MixedConverters);
            }
            for variable in &element.variables {
                if !variable.sub_query.is_empty()
                    && !previous_results.contains_key(&variable.sub_query)
                {
                    return Err(SearchError::UnknownSubQuery(variable.sub_query.clone()));
                }
            }
        }
        'elements: for (e_idx, element) in condition.elements.iter().enumerate() {
            for group in &mut self.regexes {
                let occ = group.occurrences[0];
                let other = &self.conditions[occ.condition].elements[occ.element];
                if element.regex != other.regex || element.variables != other.variables {
                    continue;
                }
                group.occurrences.push(Occurrence {
                    condition: self.conditions.len(),
                    element: e_idx,
                });
                continue 'elements;
            }
            for variable in &element.variables {
                if variable.sub_query.is_empty() {
                    continue;
                }
                self.dependencies
                    .entry(variable.sub_query.clone())
                    .or_default()
                    .insert(variable.name.clone());
            }
            self.regexes.push(RegexGroup {
                occurrences: vec![Occurrence {
                    condition: self.conditions.len(),
                    element: e_idx,
                }],
                root: RegexVariant::default(),
            });
        }
        self.conditions.push(condition.clone());
        Ok(())
    }

    /// Compile everything into a per-stream filter.
    pub fn finalize(
        self,
        converters: &HashMap<String, ConverterHandle>,
        previous_results: &HashMap<String, ResultData>,
    ) -> Result<CompiledConditions, SearchError> {
        let DataConditionsContainer {
            conditions,
            mut regexes,
            dependencies,
        } = self;
        if conditions.is_empty() {
            return Ok(CompiledConditions::AlwaysSuccess);
        }
        let converter_name = conditions[0].elements[0].converter_name.clone();
        if !converter_name.is_empty()
            && converter_name != RAW_CONVERTER
            && !converters.contains_key(&converter_name)
        {
            return Err(SearchError::ConverterNotFound(converter_name));
        }

        // stable element-then-condition order drives the matching passes
        for group in &mut regexes {
            group
                .occurrences
                .sort_by_key(|o| (o.element, o.condition));
        }
        regexes.sort_by_key(|g| (g.occurrences[0].element, g.occurrences[0].condition));

        // variable tables per referenced sub-query
        let mut impossible_sub_queries = HashMap::new();
        let mut possible_sub_queries = HashMap::new();
        let mut dependency_names: Vec<_> = dependencies.into_iter().collect();
        dependency_names.sort_by(|a, b| a.0.cmp(&b.0));
        for (sub_query, var_names) in dependency_names {
            let mut names: Vec<_> = var_names.into_iter().collect();
            names.sort();
            let variable_index: HashMap<String, usize> = names
                .into_iter()
                .enumerate()
                .map(|(i, n)| (n, i))
                .collect();
            let rd = &previous_results[&sub_query];
            let mut bad_var_data = HashSet::new();
            let mut variable_data: Vec<SubQueryVariableValues> = Vec::new();
            let mut var_data_map = HashMap::new();
            'vardata: for (vdi, entry) in rd.variable_data.iter().enumerate() {
                if entry.uses == 0 {
                    continue;
                }
                let mut quoted_data = vec![String::new(); variable_index.len()];
                for (name, &v_idx) in &variable_index {
                    let quoted: Vec<String> = entry
                        .data
                        .iter()
                        .filter(|(n, _)| n == name)
                        .map(|(_, value)| quote_meta_bytes(value))
                        .collect();
                    if quoted.is_empty() {
                        // the row lacks a required variable
                        bad_var_data.insert(vdi);
                        continue 'vardata;
                    }
                    quoted_data[v_idx] = quoted.join("|");
                }
                if let Some(pos) = variable_data
                    .iter()
                    .position(|vd| vd.quoted_data == quoted_data)
                {
                    var_data_map.insert(vdi, pos);
                } else {
                    var_data_map.insert(vdi, variable_data.len());
                    variable_data.push(SubQueryVariableValues {
                        quoted_data,
                        results: LongBitmask::new(),
                    });
                }
            }
            let mut possible = false;
            let mut impossible = LongBitmask::new();
            for (s_idx, stream_id) in rd.stream_ids.iter().enumerate() {
                let usable = rd
                    .variable_association
                    .get(stream_id)
                    .filter(|vdi| !bad_var_data.contains(*vdi));
                if let Some(vdi) = usable {
                    variable_data[var_data_map[vdi]].results.set(s_idx as u64);
                    possible = true;
                } else {
                    // the stream cannot supply the required variables
                    impossible.set(s_idx as u64);
                }
            }
            if !possible {
                return Ok(CompiledConditions::AlwaysFail);
            }
            if !impossible.is_zero() {
                impossible_sub_queries.insert(sub_query.clone(), impossible);
            }
            possible_sub_queries.insert(
                sub_query,
                SubQueryVariableData {
                    variable_index,
                    variable_data,
                },
            );
        }

        for group in &mut regexes {
            let occ = group.occurrences[0];
            let element = &conditions[occ.condition].elements[occ.element];
            build_variant_tree(&mut group.root, element, &possible_sub_queries)?;
        }

        let mut converters_to_search = Vec::new();
        if converter_name.is_empty() {
            converters_to_search.push(RAW_CONVERTER.to_string());
            let mut names: Vec<_> = converters.keys().cloned().collect();
            names.sort();
            converters_to_search.extend(names);
        } else {
            converters_to_search.push(converter_name);
        }

        Ok(CompiledConditions::Filter(Box::new(DataFilter {
            conditions,
            regexes,
            impossible_sub_queries,
            possible_sub_queries,
            converters_to_search,
        })))
    }
}

/// Pre-compile the variant tree of one element's regex.
fn build_variant_tree(
    root: &mut RegexVariant,
    element: &crate::query::DataElement,
    possible: &HashMap<String, SubQueryVariableData>,
) -> Result<(), SearchError> {
    if element.variables.is_empty() {
        root.regex = Some(compile_data_regex(&element.regex)?);
        root.profile = analyze(&element.regex)?;
        return Ok(());
    }

    // order pre-computed sub-queries by variant count, then cap the product
    let mut precompute: Vec<String> = vec![String::new()];
    let mut uses_local = false;
    for variable in &element.variables {
        if variable.sub_query.is_empty() {
            uses_local = true;
        } else if !precompute[1..].contains(&variable.sub_query) {
            precompute.push(variable.sub_query.clone());
        }
    }
    let mut variant_count: HashMap<String, usize> = HashMap::new();
    variant_count.insert(String::new(), 1);
    for sub_query in &precompute[1..] {
        variant_count.insert(
            sub_query.clone(),
            possible[sub_query].variable_data.len(),
        );
    }
    if uses_local {
        precompute.truncate(1);
    } else {
        precompute[1..].sort_by_key(|sq| variant_count[sq]);
        let mut count = 1usize;
        let mut cut = precompute.len();
        for (idx, sub_query) in precompute.iter().enumerate().skip(1) {
            if count >= MAX_PRECOMPUTED_VARIANTS {
                cut = idx;
                break;
            }
            count = count.saturating_mul(variant_count[sub_query]);
        }
        precompute.truncate(cut);
    }

    for depth in 0..precompute.len() {
        let mut position = vec![0usize; depth + 1];
        'variants: loop {
            let mut is_precondition = false;
            let mut expr = element.regex.clone();
            for variable in element.variables.iter().rev() {
                let content = if variable.sub_query.is_empty() {
                    is_precondition = true;
                    ".*".to_string()
                } else {
                    let psq = &possible[&variable.sub_query];
                    let mut vd_min = 0;
                    let mut vd_max = variant_count[&variable.sub_query];
                    for (p_idx, sub_query) in precompute[1..=depth].iter().enumerate() {
                        if &variable.sub_query == sub_query {
                            let pos = position[p_idx + 1];
                            vd_min = pos;
                            vd_max = pos + 1;
                            break;
                        }
                    }
                    if vd_max - vd_min != 1 {
                        is_precondition = true;
                    }
                    let v_idx = psq.variable_index[&variable.name];
                    psq.variable_data[vd_min..vd_max]
                        .iter()
                        .map(|vd| vd.quoted_data[v_idx].as_str())
                        .collect::<Vec<_>>()
                        .join("|")
                };
                expr = format!(
                    "{}(?:{}){}",
                    &expr[..variable.position],
                    content,
                    &expr[variable.position..]
                );
            }
            let node = node_at(root, &position[1..]);
            if depth + 1 < precompute.len() {
                let child_sub_query = precompute[depth + 1].clone();
                node.children =
                    vec![RegexVariant::default(); variant_count[&child_sub_query]];
                node.child_sub_query = child_sub_query;
            }
            node.regex = Some(compile_data_regex(&expr)?);
            node.profile = analyze(&expr)?;
            node.is_precondition = is_precondition;

            for p_idx in 1..position.len() {
                position[p_idx] += 1;
                if position[p_idx] < variant_count[&precompute[p_idx]] {
                    continue 'variants;
                }
                position[p_idx] = 0;
            }
            break;
        }
    }
    Ok(())
}

fn node_at<'a>(mut node: &'a mut RegexVariant, path: &[usize]) -> &'a mut RegexVariant {
    for &p in path {
        node = &mut node.children[p];
    }
    node
}

fn analyze(pattern: &str) -> Result<RegexProfile, SearchError> {
    profile(pattern).map_err(|e| SearchError::Regex(e.to_string()))
}

impl DataFilter {
    /// Run the filter against one stream, trying each candidate converter
    /// until one matches.
    pub fn matches_stream(
        &self,
        sc: &mut SearchContext,
        record: &StreamRecord,
        source: &mut StreamSource<'_>,
    ) -> Result<bool, SearchError> {
        for (sub_query, impossible) in &self.impossible_sub_queries {
            sc.allowed_sub_queries.remove_single(sub_query, impossible);
        }
        if sc.allowed_sub_queries.any_empty() {
            return Ok(false);
        }
        for converter_name in &self.converters_to_search {
            let (buffers, buffer_lengths) = if converter_name == RAW_CONVERTER {
                let payload = source.raw.stream_payload(record)?;
                (payload.buffers, payload.buffer_lengths)
            } else {
                let converter = source
                    .converters
                    .get(converter_name)
                    .ok_or_else(|| SearchError::ConverterNotFound(converter_name.clone()))?;
                let data = converter.data_for_search(record.stream_id)?;
                if !data.was_cached {
                    // not converted yet; no match on this converter
                    continue;
                }
                (data.buffers, data.buffer_lengths)
            };
            if self.run_on_buffers(sc, &buffers, &buffer_lengths)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn run_on_buffers(
        &self,
        sc: &mut SearchContext,
        buffers: &[Vec<u8>; 2],
        buffer_lengths: &[[usize; 2]],
    ) -> Result<bool, SearchError> {
        let mut progress: Vec<Vec<ProgressVariant>> = self
            .conditions
            .iter()
            .map(|_| vec![ProgressVariant::default()])
            .collect();

        loop {
            let mut recheck = false;
            for group in &self.regexes {
                for occ in &group.occurrences {
                    let condition = &self.conditions[occ.condition];
                    let element = &condition.elements[occ.element];
                    let dir = element.direction.idx();
                    let variants = &mut progress[occ.condition];
                    let mut p_idx = 0;
                    while p_idx < variants.len() {
                        if variants[p_idx].n_successful != occ.element {
                            p_idx += 1;
                            continue;
                        }
                        let mut p = variants[p_idx].clone();
                        let mut appended = Vec::new();
                        let outcome = self.step_variant(
                            &mut p,
                            &mut appended,
                            group,
                            element,
                            condition,
                            dir,
                            buffers,
                            buffer_lengths,
                            &mut recheck,
                        )?;
                        variants[p_idx] = p;
                        variants.extend(appended);
                        if matches!(outcome, StepOutcome::StreamFailed) {
                            return Ok(false);
                        }
                        p_idx += 1;
                    }
                }
            }
            if !recheck {
                break;
            }
        }

        // judge each condition's variants, then collect variables
        for (c_idx, condition) in self.conditions.iter().enumerate() {
            for p in &progress[c_idx] {
                let n_unsuccessful = condition.elements.len() - p.n_successful;
                if n_unsuccessful >= 2 || ((n_unsuccessful != 0) != condition.inverted) {
                    if p.variant.is_empty() {
                        return Ok(false);
                    }
                    if p.variant.len() == 1 {
                        if let Some((sub_query, &v)) = p.variant.iter().next() {
                            let rows =
                                &self.possible_sub_queries[sub_query].variable_data[v].results;
                            sc.allowed_sub_queries.remove_single(sub_query, rows);
                        }
                    } else {
                        let combo = p
                            .variant
                            .iter()
                            .map(|(sub_query, &v)| {
                                (
                                    sub_query.clone(),
                                    self.possible_sub_queries[sub_query].variable_data[v]
                                        .results
                                        .clone(),
                                )
                            })
                            .collect();
                        sc.allowed_sub_queries.remove_combo(combo);
                    }
                    if sc.allowed_sub_queries.any_empty() {
                        return Ok(false);
                    }
                    continue;
                }
                for (name, value) in &p.variables {
                    let values = sc.output_variables.entry(name.clone()).or_default();
                    if !values.contains(value) {
                        values.push(value.clone());
                    }
                }
            }
        }
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    fn step_variant(
        &self,
        p: &mut ProgressVariant,
        appended: &mut Vec<ProgressVariant>,
        group: &RegexGroup,
        element: &crate::query::DataElement,
        condition: &DataCondition,
        dir: usize,
        buffers: &[Vec<u8>; 2],
        buffer_lengths: &[[usize; 2]],
        recheck: &mut bool,
    ) -> Result<StepOutcome, SearchError> {
        if p.regex.is_none() {
            // find the deepest tree node this variant has chosen into
            let mut root = &group.root;
            while !root.child_sub_query.is_empty() {
                match p.variant.get(&root.child_sub_query) {
                    Some(&v) => root = &root.children[v],
                    None => break,
                }
            }
            let mut explode_one_variant = false;
            match p.state {
                ProgressState::Uninitialized => {
                    if let Some(regex) = &root.regex {
                        p.regex = Some(regex.clone());
                        p.profile = root.profile.clone();
                        p.state = if root.is_precondition {
                            ProgressState::Precondition
                        } else {
                            ProgressState::Exact
                        };
                    }
                }
                ProgressState::PreconditionMatched => {
                    if root.child_sub_query.is_empty() {
                        explode_one_variant = true;
                    } else {
                        // one variant per child; the first replaces in place
                        for (c_idx, child) in root.children.iter().enumerate() {
                            let mut np = ProgressVariant {
                                stream_offset: p.stream_offset,
                                n_successful: p.n_successful,
                                variables: p.variables.clone(),
                                regex: child.regex.clone(),
                                profile: child.profile.clone(),
                                variant: p.variant.clone(),
                                state: if child.is_precondition {
                                    ProgressState::Precondition
                                } else {
                                    ProgressState::Exact
                                },
                            };
                            np.variant.insert(root.child_sub_query.clone(), c_idx);
                            if c_idx == 0 {
                                *p = np;
                            } else {
                                appended.push(np);
                            }
                        }
                    }
                }
                // these states always carry a compiled regex
                ProgressState::Exact | ProgressState::Precondition => {}
            }
            if p.regex.is_none() {
                self.compile_for_variant(p, element, explode_one_variant, appended)?;
            }
        }

        let Some(regex) = p.regex.clone() else {
            return Ok(StepOutcome::Continue);
        };
        let min_length = p.profile.accepted_length.min;
        let full_length = buffers[dir].len();
        let mut buffer: &[u8] = &buffers[dir][p.stream_offset[dir]..];
        if buffer.len() < min_length {
            return Ok(StepOutcome::Continue);
        }
        if !p.profile.prefix.is_empty() {
            let Some(pos) = find_sub(buffer, &p.profile.prefix) else {
                p.stream_offset[dir] = full_length;
                return Ok(StepOutcome::Continue);
            };
            p.stream_offset[dir] += pos;
            buffer = &buffer[pos..];
            if buffer.len() < min_length {
                return Ok(StepOutcome::Continue);
            }
        }
        if !p.profile.suffix.is_empty() {
            let Some(pos) = rfind_sub(buffer, &p.profile.suffix) else {
                p.stream_offset[dir] = full_length;
                return Ok(StepOutcome::Continue);
            };
            buffer = &buffer[..pos + p.profile.suffix.len()];
            if buffer.len() < min_length {
                return Ok(StepOutcome::Continue);
            }
        }

        let captures = if p.profile.accepted_length.is_exact()
            && p.profile.prefix.is_empty()
            && !p.profile.suffix.is_empty()
        {
            // slide fixed-length windows that end in the suffix
            let before_suffix = min_length - p.profile.suffix.len();
            loop {
                if buffer.len() < min_length {
                    p.stream_offset[dir] = full_length;
                    return Ok(StepOutcome::Continue);
                }
                let Some(pos) = find_sub(&buffer[before_suffix..], &p.profile.suffix) else {
                    p.stream_offset[dir] = full_length;
                    return Ok(StepOutcome::Continue);
                };
                p.stream_offset[dir] += pos;
                buffer = &buffer[pos..];
                if let Some(captures) = regex.captures(&buffer[..min_length]) {
                    break Some(captures);
                }
                p.stream_offset[dir] += 1;
                buffer = &buffer[1..];
            }
        } else {
            regex.captures(buffer)
        };

        let Some(captures) = captures else {
            p.stream_offset[dir] = full_length;
            return Ok(StepOutcome::Continue);
        };

        if p.state == ProgressState::Precondition {
            *recheck = true;
            p.regex = None;
            p.state = ProgressState::PreconditionMatched;
            return Ok(StepOutcome::Continue);
        }

        p.n_successful += 1;
        if p.n_successful != condition.elements.len() {
            // a sequence advanced; later elements need another pass
            *recheck = true;
        } else if condition.inverted {
            return Ok(StepOutcome::StreamFailed);
        }
        for name in regex.capture_names().flatten() {
            if let Some(m) = captures.name(name) {
                if p.variables.contains_key(name) {
                    return Err(SearchError::VariableAlreadySeen(name.to_string()));
                }
                p.variables.insert(name.to_string(), m.as_bytes().to_vec());
            }
        }
        p.regex = None;
        p.state = ProgressState::Uninitialized;

        let end = captures.get(0).map(|m| m.end()).unwrap_or(0);
        if end != 0 {
            // a later regex in this direction may consume the byte after
            // the match; the other direction may not observe bytes received
            // before the handover containing the match end
            p.stream_offset[dir] += end;
            let offset = p.stream_offset[dir];
            let other = 1 - dir;
            for i in (1..buffer_lengths.len()).rev() {
                if buffer_lengths[i - 1][dir] < offset {
                    p.stream_offset[other] = p.stream_offset[other].max(buffer_lengths[i][other]);
                    break;
                }
            }
        }
        Ok(StepOutcome::Continue)
    }

    /// Build this variant's concrete regex from the element template,
    /// substituting locally captured values and chosen sub-query rows.
    fn compile_for_variant(
        &self,
        p: &mut ProgressVariant,
        element: &crate::query::DataElement,
        explode_one_variant: bool,
        appended: &mut Vec<ProgressVariant>,
    ) -> Result<(), SearchError> {
        let mut expr = element.regex.clone();
        let mut explode_one = explode_one_variant;
        p.state = ProgressState::Exact;
        for variable in element.variables.iter().rev() {
            let content = if variable.sub_query.is_empty() {
                let value = p
                    .variables
                    .get(&variable.name)
                    .ok_or_else(|| SearchError::VariableNotDefined(variable.name.clone()))?;
                quote_meta_bytes(value)
            } else {
                let psq = &self.possible_sub_queries[&variable.sub_query];
                let v_idx = psq.variable_index[&variable.name];
                match p.variant.get(&variable.sub_query).copied() {
                    Some(chosen) => psq.variable_data[chosen].quoted_data[v_idx].clone(),
                    None if explode_one => {
                        // the precondition matched; split into one variant
                        // per row, continuing on the first
                        explode_one = false;
                        for row in 1..psq.variable_data.len() {
                            let mut np = ProgressVariant {
                                stream_offset: p.stream_offset,
                                n_successful: p.n_successful,
                                variables: p.variables.clone(),
                                regex: None,
                                profile: RegexProfile::default(),
                                variant: p.variant.clone(),
                                state: ProgressState::Uninitialized,
                            };
                            np.variant.insert(variable.sub_query.clone(), row);
                            appended.push(np);
                        }
                        p.variant.insert(variable.sub_query.clone(), 0);
                        psq.variable_data[0].quoted_data[v_idx].clone()
                    }
                    None => {
                        p.state = ProgressState::Precondition;
                        psq.variable_data
                            .iter()
                            .map(|vd| vd.quoted_data[v_idx].as_str())
                            .collect::<Vec<_>>()
                            .join("|")
                    }
                }
            };
            expr = format!(
                "{}(?:{}){}",
                &expr[..variable.position],
                content,
                &expr[variable.position..]
            );
        }
        p.regex = Some(compile_data_regex(&expr)?);
        p.profile = analyze(&expr)?;
        Ok(())
    }
}
