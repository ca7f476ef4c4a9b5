use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::warn;
use tributary::error::{Result, SourceError};
use tributary::StreamSlice;

use super::intervals::IntervalSet;
use super::Cursor;
use crate::datetime::{format_datetime, value_to_datetime, IsoDuration};
use crate::interpolation::{Context, Template};
use crate::requester::{RequestOption, RequestOptions};

const STATE_TYPE: &str = "date-range";

/// `incremental_sync` as declared in the manifest, templates unevaluated.
#[derive(Debug, Clone)]
pub struct DatetimeCursorDefinition {
    pub cursor_field: String,
    pub start: Template,
    pub start_format: Option<String>,
    pub end: Option<Template>,
    pub end_format: Option<String>,
    pub step: Option<Template>,
    pub lookback: Option<Template>,
    pub granularity: Option<Template>,
    pub datetime_format: String,
    pub cursor_datetime_formats: Vec<String>,
    pub partition_field_start: String,
    pub partition_field_end: String,
    pub start_time_option: Option<RequestOption>,
    pub end_time_option: Option<RequestOption>,
}

impl DatetimeCursorDefinition {
    /// Evaluate the templates once for a read. `ctx.now()` is the default end.
    pub fn resolve(&self, ctx: &Context) -> Result<Arc<DatetimeParams>> {
        let mut parse_formats = self.cursor_datetime_formats.clone();
        parse_formats.push(self.datetime_format.clone());

        // Fail early on a bad output format
        format_datetime(&ctx.now(), &self.datetime_format)
            .map_err(|e| SourceError::Manifest(e.to_string()))?;

        let start = read_boundary(&self.start, self.start_format.as_ref(), &parse_formats, ctx)?
            .ok_or_else(|| SourceError::Config("start_datetime is empty".into()))?;
        let end = match &self.end {
            Some(template) => {
                read_boundary(template, self.end_format.as_ref(), &parse_formats, ctx)?.unwrap_or(ctx.now())
            }
            None => ctx.now(),
        };

        Ok(Arc::new(DatetimeParams {
            cursor_field: self.cursor_field.clone(),
            start,
            end,
            step: eval_duration(self.step.as_ref(), ctx, "step")?.filter(IsoDuration::is_positive),
            lookback: eval_duration(self.lookback.as_ref(), ctx, "lookback_window")?,
            granularity: eval_duration(self.granularity.as_ref(), ctx, "cursor_granularity")?
                .unwrap_or_else(|| IsoDuration::from_fixed(chrono::Duration::seconds(1))),
            datetime_format: self.datetime_format.clone(),
            parse_formats,
            partition_field_start: self.partition_field_start.clone(),
            partition_field_end: self.partition_field_end.clone(),
            start_time_option: self.start_time_option.clone(),
            end_time_option: self.end_time_option.clone(),
        }))
    }
}

fn read_boundary(
    template: &Template,
    declared: Option<&String>,
    formats: &[String],
    ctx: &Context,
) -> Result<Option<DateTime<Utc>>> {
    let value = template.eval(ctx)?;
    if value.is_null() || value.as_str() == Some("") {
        return Ok(None);
    }
    let mut candidates: Vec<String> = declared.cloned().into_iter().collect();
    candidates.extend(formats.iter().cloned());
    value_to_datetime(&value, &candidates)
        .map(Some)
        .ok_or_else(|| SourceError::Config(format!("'{}' is not a valid datetime", value_text(&value))))
}

fn value_text(value: &Value) -> String {
    value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string())
}

fn eval_duration(template: Option<&Template>, ctx: &Context, what: &str) -> Result<Option<IsoDuration>> {
    let text = match template {
        Some(t) => t.eval_string(ctx)?,
        None => None,
    };
    match text {
        Some(text) => IsoDuration::parse(&text)
            .map(Some)
            .map_err(|e| SourceError::Manifest(format!("{}: {}", what, e))),
        None => Ok(None),
    }
}

/// Where a record's cursor value falls relative to its slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordPosition {
    Inside(DateTime<Utc>),
    Outside(DateTime<Utc>),
    Missing,
    Unparseable,
}

/// Cursor settings resolved for one read. Shared by the cursor and the
/// workers that check record bounds.
#[derive(Debug, Clone)]
pub struct DatetimeParams {
    pub cursor_field: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub step: Option<IsoDuration>,
    pub lookback: Option<IsoDuration>,
    pub granularity: IsoDuration,
    pub datetime_format: String,
    parse_formats: Vec<String>,
    pub partition_field_start: String,
    pub partition_field_end: String,
    start_time_option: Option<RequestOption>,
    end_time_option: Option<RequestOption>,
}

impl DatetimeParams {
    pub fn parse(&self, value: &Value) -> Option<DateTime<Utc>> {
        value_to_datetime(value, &self.parse_formats)
    }

    pub fn format(&self, dt: &DateTime<Utc>) -> String {
        format_datetime(dt, &self.datetime_format)
            .unwrap_or_else(|_| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn slice_bounds(&self, slice: &StreamSlice) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let start = self.parse(slice.cursor_slice.get(&self.partition_field_start)?)?;
        let end = self.parse(slice.cursor_slice.get(&self.partition_field_end)?)?;
        Some((start, end))
    }

    /// Records belong to `[start, end + granularity)`.
    pub fn position(&self, slice: &StreamSlice, record: &Map<String, Value>) -> RecordPosition {
        let value = match record.get(&self.cursor_field) {
            None | Some(Value::Null) => return RecordPosition::Missing,
            Some(v) => v,
        };
        let dt = match self.parse(value) {
            Some(dt) => dt,
            None => return RecordPosition::Unparseable,
        };
        match self.slice_bounds(slice) {
            Some((start, end)) => {
                let upper = self.granularity.add_to(end).unwrap_or(end);
                if dt >= start && dt < upper {
                    RecordPosition::Inside(dt)
                } else {
                    RecordPosition::Outside(dt)
                }
            }
            None => RecordPosition::Inside(dt),
        }
    }

    pub fn request_options(&self, slice: &StreamSlice) -> RequestOptions {
        let mut options = RequestOptions::default();
        for (option, field) in [
            (&self.start_time_option, &self.partition_field_start),
            (&self.end_time_option, &self.partition_field_end),
        ] {
            if let (Some(option), Some(value)) = (option, slice.cursor_slice.get(field)) {
                options.inject(option, value.clone());
            }
        }
        options
    }

    /// Windows covering `[lower, upper]` (or `[lower, upper)` when `upper`
    /// is not the end of the range). Every window but the last ends one
    /// granularity step before the next one starts.
    fn windows(
        &self,
        lower: DateTime<Utc>,
        upper: DateTime<Utc>,
        upper_is_end: bool,
    ) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        let mut out = Vec::new();
        let mut start = lower;
        while start < upper {
            let next = self
                .step
                .and_then(|step| step.add_to(start))
                .unwrap_or(upper);
            if next >= upper {
                let end = if upper_is_end {
                    upper
                } else {
                    self.granularity.sub_from(upper).unwrap_or(upper)
                };
                if end >= start {
                    out.push((start, end));
                }
                break;
            }
            let end = self.granularity.sub_from(next).unwrap_or(next).max(start);
            out.push((start, end));
            start = next;
        }
        out
    }

    /// Fill the holes in `done`, then the trailing range from the last
    /// interval (minus lookback, floored to granularity) up to `end`.
    fn plan(&self, done: &IntervalSet) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        let last = match done.last() {
            Some(last) => last,
            None => return self.windows(self.start, self.end, true),
        };

        let reread_from = self
            .lookback
            .and_then(|lookback| lookback.sub_from(last.end))
            .unwrap_or(last.end);
        let trailing = self.granularity.floor(reread_from).max(self.start);

        let mut out = Vec::new();
        let mut lower = self.start;
        for interval in done.intervals() {
            let upper = interval.start.min(trailing);
            if lower < upper {
                out.extend(self.windows(lower, upper, false));
            }
            lower = lower.max(self.granularity.add_to(interval.end).unwrap_or(interval.end));
        }
        out.extend(self.windows(trailing, self.end, true));
        out
    }

    fn slice(&self, partition: &StreamSlice, start: DateTime<Utc>, end: DateTime<Utc>) -> StreamSlice {
        let mut bounds = Map::new();
        bounds.insert(self.partition_field_start.clone(), Value::String(self.format(&start)));
        bounds.insert(self.partition_field_end.clone(), Value::String(self.format(&end)));
        partition.with_cursor_slice(bounds)
    }
}

/// Incremental cursor over a datetime field.
///
/// Holds the intervals known to be complete: the ones seeded from state
/// plus every slice closed during this read. State publishes all of them,
/// gaps included.
pub struct DatetimeCursor {
    params: Arc<DatetimeParams>,
    done: IntervalSet,
}

impl DatetimeCursor {
    pub fn new(params: Arc<DatetimeParams>, state: Option<&Value>) -> Result<Self> {
        let mut done = IntervalSet::new(params.granularity);
        match state {
            Some(Value::Object(map)) if map.contains_key("slices") => {
                let slices = map
                    .get("slices")
                    .and_then(Value::as_array)
                    .ok_or_else(|| SourceError::State("'slices' must be a list".into()))?;
                for entry in slices {
                    let bound = |key: &str| entry.get(key).and_then(|v| params.parse(v));
                    match (bound("start"), bound("end")) {
                        (Some(start), Some(end)) => {
                            done.insert(start, end, bound("most_recent_cursor_value"));
                        }
                        _ => {
                            return Err(SourceError::State(format!(
                                "unreadable slice in state: {}",
                                entry
                            )))
                        }
                    }
                }
            }
            Some(Value::Object(map)) if map.contains_key(&params.cursor_field) => {
                // Sequential state: everything from start up to the value is done
                let raw = &map[&params.cursor_field];
                let value = params.parse(raw).ok_or_else(|| {
                    SourceError::State(format!(
                        "'{}' in state is not a valid datetime: {}",
                        params.cursor_field, raw
                    ))
                })?;
                done.insert(params.start.min(value), value, Some(value));
            }
            Some(Value::Object(map)) if map.is_empty() => {}
            Some(Value::Null) | None => {}
            Some(other) => {
                warn!(cursor_field = %params.cursor_field, state = %other, "Ignoring unrecognized cursor state");
            }
        }
        Ok(Self { params, done })
    }

    pub fn params(&self) -> &Arc<DatetimeParams> {
        &self.params
    }
}

impl Cursor for DatetimeCursor {
    fn stream_slices(&mut self, partition: &StreamSlice) -> Result<Vec<StreamSlice>> {
        Ok(self
            .params
            .plan(&self.done)
            .into_iter()
            .map(|(start, end)| self.params.slice(partition, start, end))
            .collect())
    }

    fn close_partition(
        &mut self,
        slice: &StreamSlice,
        most_recent: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let (start, end) = self.params.slice_bounds(slice).ok_or_else(|| {
            SourceError::State(format!("slice has no readable bounds: {}", slice.to_value()))
        })?;
        Ok(self.done.insert(start, end, most_recent))
    }

    fn state(&self) -> Option<Value> {
        if self.done.is_empty() {
            return None;
        }
        let slices: Vec<Value> = self
            .done
            .intervals()
            .iter()
            .map(|i| {
                json!({
                    "start": self.params.format(&i.start),
                    "end": self.params.format(&i.end),
                    "most_recent_cursor_value": self.params.format(&i.most_recent),
                })
            })
            .collect();
        Some(json!({"state_type": STATE_TYPE, "slices": slices}))
    }

    fn template_state(&self, _slice: &StreamSlice) -> Value {
        let mut state = Map::new();
        if let Some(last) = self.done.last() {
            state.insert(
                self.params.cursor_field.clone(),
                Value::String(self.params.format(&last.most_recent)),
            );
        }
        Value::Object(state)
    }
}
