//! In-memory repository fixtures for gateway tests.
//!
//! These mirror the Postgres implementations' observable semantics
//! (validation before write, per-item bulk granularity, priority-ordered
//! pending commands, idempotent expiry) over plain maps, so the handlers,
//! stream worker, and supervisor can be exercised without a database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use labgw_core::model::{
    Alert, AlertSeverity, AlertType, Command, CommandStatus, Device, DeviceSession, DeviceStatus,
    Measurement, MeasurementBatch, MeasurementStats, QualityCode,
};
use labgw_core::{GatewayError, GatewayResult, OpContext};
use labgw_storage::session::SessionStore;
use labgw_storage::{
    AggregationRequest, AggregationResult, AlertFilter, AlertRepository, BulkResult, CommandFilter,
    CommandRepository, DeviceFilter, DeviceRepository, MeasurementFilter, MeasurementRepository,
    RepositoryManager, SortOrder, TimeRange,
};

#[derive(Default)]
pub struct InMemoryRepos {
    pub devices: Mutex<HashMap<String, Device>>,
    pub measurements: Mutex<Vec<Measurement>>,
    pub commands: Mutex<Vec<Command>>,
    pub alerts: Mutex<Vec<Alert>>,
    pub sessions: Mutex<Vec<DeviceSession>>,
    pub partitions: Mutex<Vec<(i32, u32)>>,
    pub fail_health: AtomicBool,
}

impl InMemoryRepos {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device_status(&self, id: &str) -> Option<DeviceStatus> {
        self.devices.lock().unwrap().get(id).map(|d| d.status)
    }

    pub fn active_sessions_for(&self, device_id: &str) -> Vec<DeviceSession> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.device_id == device_id && s.is_active)
            .cloned()
            .collect()
    }

    pub fn alerts_of_type(&self, alert_type: AlertType) -> Vec<Alert> {
        self.alerts
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.alert_type == alert_type)
            .cloned()
            .collect()
    }

    pub fn command_by_id(&self, command_id: &str) -> Option<Command> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.command_id == command_id)
            .cloned()
    }
}

fn device_matches(device: &Device, filter: &DeviceFilter) -> bool {
    if !filter.device_ids.is_empty() && !filter.device_ids.contains(&device.id) {
        return false;
    }
    if !filter.types.is_empty() && !filter.types.contains(&device.device_type) {
        return false;
    }
    if !filter.statuses.is_empty() && !filter.statuses.contains(&device.status) {
        return false;
    }
    if !filter
        .capabilities
        .iter()
        .all(|c| device.capabilities.contains(c))
    {
        return false;
    }
    if let Some(after) = filter.last_seen_after {
        match device.last_seen {
            Some(seen) if seen >= after => {}
            _ => return false,
        }
    }
    if let Some(before) = filter.last_seen_before {
        match device.last_seen {
            Some(seen) if seen <= before => {}
            _ => return false,
        }
    }
    for (key, expected) in &filter.metadata_filters {
        match device.metadata.get(key) {
            Some(value) if value.as_display_string() == *expected => {}
            _ => return false,
        }
    }
    true
}

fn sort_devices(devices: &mut [Device], sort_by: &str, order: SortOrder) {
    devices.sort_by(|a, b| {
        let ordering = match sort_by {
            "id" => a.id.cmp(&b.id),
            "name" => a.name.cmp(&b.name),
            "type" => a.device_type.cmp(&b.device_type),
            "status" => a.status.as_str().cmp(b.status.as_str()),
            "last_seen" => a.last_seen.cmp(&b.last_seen),
            "registered_at" => a.registered_at.cmp(&b.registered_at),
            _ => a.updated_at.cmp(&b.updated_at),
        };
        match order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    });
}

fn page<T: Clone>(items: &[T], offset: i64, limit: i64) -> Vec<T> {
    items
        .iter()
        .skip(offset.max(0) as usize)
        .take(limit.max(0) as usize)
        .cloned()
        .collect()
}

#[async_trait]
impl DeviceRepository for InMemoryRepos {
    async fn create(&self, ctx: &OpContext, device: &Device) -> GatewayResult<()> {
        ctx.check()?;
        device.validate()?;
        let mut devices = self.devices.lock().unwrap();
        if devices.contains_key(&device.id) {
            return Err(GatewayError::AlreadyExists("device"));
        }
        devices.insert(device.id.clone(), device.clone());
        Ok(())
    }

    async fn get_by_id(&self, ctx: &OpContext, id: &str) -> GatewayResult<Option<Device>> {
        ctx.check()?;
        Ok(self.devices.lock().unwrap().get(id).cloned())
    }

    async fn update(&self, ctx: &OpContext, device: &Device) -> GatewayResult<()> {
        ctx.check()?;
        device.validate()?;
        let mut devices = self.devices.lock().unwrap();
        if !devices.contains_key(&device.id) {
            return Err(GatewayError::NotFound("device"));
        }
        devices.insert(device.id.clone(), device.clone());
        Ok(())
    }

    async fn delete(&self, ctx: &OpContext, id: &str) -> GatewayResult<()> {
        ctx.check()?;
        self.devices
            .lock()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or(GatewayError::NotFound("device"))
    }

    async fn create_bulk(&self, ctx: &OpContext, devices: &[Device]) -> GatewayResult<BulkResult> {
        let mut result = BulkResult::default();
        for (index, device) in devices.iter().enumerate() {
            match DeviceRepository::create(self, ctx, device).await {
                Ok(()) => result.record_success(),
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err) => result.record_failure(index, err.to_string()),
            }
        }
        Ok(result)
    }

    async fn update_bulk(&self, ctx: &OpContext, devices: &[Device]) -> GatewayResult<BulkResult> {
        let mut result = BulkResult::default();
        for (index, device) in devices.iter().enumerate() {
            match DeviceRepository::update(self, ctx, device).await {
                Ok(()) => result.record_success(),
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err) => result.record_failure(index, err.to_string()),
            }
        }
        Ok(result)
    }

    async fn list(&self, ctx: &OpContext, filter: &DeviceFilter) -> GatewayResult<Vec<Device>> {
        ctx.check()?;
        let devices = self.devices.lock().unwrap();
        let mut matched: Vec<Device> = devices
            .values()
            .filter(|d| device_matches(d, filter))
            .cloned()
            .collect();
        let sort_by = filter.filter.sort_by.as_deref().unwrap_or("updated_at");
        sort_devices(&mut matched, sort_by, filter.filter.order);
        Ok(page(&matched, filter.filter.offset, filter.filter.limit))
    }

    async fn count(&self, ctx: &OpContext, filter: &DeviceFilter) -> GatewayResult<i64> {
        ctx.check()?;
        let devices = self.devices.lock().unwrap();
        Ok(devices.values().filter(|d| device_matches(d, filter)).count() as i64)
    }

    async fn update_status(
        &self,
        ctx: &OpContext,
        device_id: &str,
        status: DeviceStatus,
    ) -> GatewayResult<()> {
        ctx.check()?;
        let mut devices = self.devices.lock().unwrap();
        let device = devices
            .get_mut(device_id)
            .ok_or(GatewayError::NotFound("device"))?;
        device.set_status(status);
        Ok(())
    }

    async fn update_last_seen(
        &self,
        ctx: &OpContext,
        device_id: &str,
        timestamp: DateTime<Utc>,
    ) -> GatewayResult<()> {
        ctx.check()?;
        let mut devices = self.devices.lock().unwrap();
        let device = devices
            .get_mut(device_id)
            .ok_or(GatewayError::NotFound("device"))?;
        device.last_seen = Some(timestamp);
        device.updated_at = timestamp;
        Ok(())
    }

    async fn search_by_metadata(
        &self,
        ctx: &OpContext,
        metadata: &HashMap<String, String>,
    ) -> GatewayResult<Vec<Device>> {
        let filter = DeviceFilter {
            metadata_filters: metadata.clone(),
            ..DeviceFilter::default()
        };
        DeviceRepository::list(self, ctx, &filter).await
    }

    async fn get_by_capability(
        &self,
        ctx: &OpContext,
        capability: &str,
    ) -> GatewayResult<Vec<Device>> {
        let filter = DeviceFilter {
            capabilities: vec![capability.to_string()],
            ..DeviceFilter::default()
        };
        DeviceRepository::list(self, ctx, &filter).await
    }

    async fn get_online(&self, ctx: &OpContext) -> GatewayResult<Vec<Device>> {
        let filter = DeviceFilter {
            statuses: vec![DeviceStatus::Online],
            ..DeviceFilter::default()
        };
        DeviceRepository::list(self, ctx, &filter).await
    }

    async fn get_offline(
        &self,
        ctx: &OpContext,
        threshold: Duration,
    ) -> GatewayResult<Vec<Device>> {
        ctx.check()?;
        let cutoff = Utc::now() - chrono::Duration::from_std(threshold).unwrap();
        let devices = self.devices.lock().unwrap();
        Ok(devices
            .values()
            .filter(|d| {
                d.status == DeviceStatus::Offline
                    || d.last_seen.map(|seen| seen < cutoff).unwrap_or(true)
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MeasurementRepository for InMemoryRepos {
    async fn create(&self, ctx: &OpContext, measurement: &Measurement) -> GatewayResult<()> {
        ctx.check()?;
        measurement.validate()?;
        self.measurements.lock().unwrap().push(measurement.clone());
        Ok(())
    }

    async fn get_by_id(&self, ctx: &OpContext, id: &str) -> GatewayResult<Option<Measurement>> {
        ctx.check()?;
        Ok(self
            .measurements
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.id == id)
            .cloned())
    }

    async fn delete(&self, ctx: &OpContext, id: &str) -> GatewayResult<()> {
        ctx.check()?;
        let mut measurements = self.measurements.lock().unwrap();
        let before = measurements.len();
        measurements.retain(|m| m.id != id);
        if measurements.len() == before {
            return Err(GatewayError::NotFound("measurement"));
        }
        Ok(())
    }

    async fn create_bulk(
        &self,
        ctx: &OpContext,
        measurements: &[Measurement],
    ) -> GatewayResult<BulkResult> {
        let mut result = BulkResult::default();
        for (index, measurement) in measurements.iter().enumerate() {
            ctx.check()?;
            if let Err(err) = measurement.validate() {
                result.record_failure(index, err.to_string());
                continue;
            }
            self.measurements.lock().unwrap().push(measurement.clone());
            result.record_success();
        }
        Ok(result)
    }

    async fn create_batch(
        &self,
        ctx: &OpContext,
        batch: &MeasurementBatch,
    ) -> GatewayResult<BulkResult> {
        let mut stamped = batch.clone();
        stamped.normalize();
        MeasurementRepository::create_bulk(self, ctx, &stamped.measurements).await
    }

    async fn list(
        &self,
        ctx: &OpContext,
        filter: &MeasurementFilter,
    ) -> GatewayResult<Vec<Measurement>> {
        ctx.check()?;
        let measurements = self.measurements.lock().unwrap();
        let mut matched: Vec<Measurement> = measurements
            .iter()
            .filter(|m| measurement_matches(m, filter))
            .cloned()
            .collect();
        matched.sort_by(|a, b| match filter.filter.order {
            SortOrder::Asc => a.timestamp.cmp(&b.timestamp),
            SortOrder::Desc => b.timestamp.cmp(&a.timestamp),
        });
        Ok(page(&matched, filter.filter.offset, filter.filter.limit))
    }

    async fn count(&self, ctx: &OpContext, filter: &MeasurementFilter) -> GatewayResult<i64> {
        ctx.check()?;
        let measurements = self.measurements.lock().unwrap();
        Ok(measurements
            .iter()
            .filter(|m| measurement_matches(m, filter))
            .count() as i64)
    }

    async fn get_by_time_range(
        &self,
        ctx: &OpContext,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> GatewayResult<Vec<Measurement>> {
        let filter = MeasurementFilter {
            device_ids: vec![device_id.to_string()],
            time_range: TimeRange {
                start: Some(start),
                end: Some(end),
            },
            ..MeasurementFilter::default()
        };
        MeasurementRepository::list(self, ctx, &filter).await
    }

    async fn get_latest(
        &self,
        ctx: &OpContext,
        device_id: &str,
        measurement_type: &str,
    ) -> GatewayResult<Option<Measurement>> {
        ctx.check()?;
        let measurements = self.measurements.lock().unwrap();
        Ok(measurements
            .iter()
            .filter(|m| m.device_id == device_id && m.measurement_type == measurement_type)
            .max_by_key(|m| m.timestamp)
            .cloned())
    }

    async fn get_latest_by_device(
        &self,
        ctx: &OpContext,
        device_id: &str,
        limit: i64,
    ) -> GatewayResult<Vec<Measurement>> {
        let filter = MeasurementFilter {
            device_ids: vec![device_id.to_string()],
            filter: labgw_storage::Filter {
                limit,
                ..labgw_storage::Filter::default()
            },
            ..MeasurementFilter::default()
        };
        MeasurementRepository::list(self, ctx, &filter).await
    }

    async fn aggregate(
        &self,
        ctx: &OpContext,
        request: &AggregationRequest,
    ) -> GatewayResult<Vec<AggregationResult>> {
        ctx.check()?;
        let measurements = self.measurements.lock().unwrap();
        let matched: Vec<&Measurement> = measurements
            .iter()
            .filter(|m| {
                (request.device_ids.is_empty() || request.device_ids.contains(&m.device_id))
                    && (request.types.is_empty() || request.types.contains(&m.measurement_type))
            })
            .collect();
        if matched.is_empty() {
            return Ok(Vec::new());
        }
        let count = matched.len() as i64;
        let sum: f64 = matched.iter().map(|m| m.value).sum();
        let value = match request.aggregation_type.as_str() {
            "count" => count as f64,
            "sum" => sum,
            "min" => matched.iter().map(|m| m.value).fold(f64::INFINITY, f64::min),
            "max" => matched
                .iter()
                .map(|m| m.value)
                .fold(f64::NEG_INFINITY, f64::max),
            _ => sum / count as f64,
        };
        Ok(vec![AggregationResult {
            device_id: request.device_ids.first().cloned().unwrap_or_default(),
            measurement_type: request.types.first().cloned().unwrap_or_default(),
            timestamp: matched.iter().map(|m| m.timestamp).min().unwrap(),
            value,
            count,
        }])
    }

    async fn get_statistics(
        &self,
        ctx: &OpContext,
        filter: &MeasurementFilter,
    ) -> GatewayResult<MeasurementStats> {
        ctx.check()?;
        let measurements = self.measurements.lock().unwrap();
        let matched: Vec<&Measurement> = measurements
            .iter()
            .filter(|m| measurement_matches(m, filter))
            .collect();
        let count = matched.len() as i64;
        let sum: f64 = matched.iter().map(|m| m.value).sum();
        Ok(MeasurementStats {
            device_id: filter.device_ids.first().cloned().unwrap_or_default(),
            measurement_type: filter.types.first().cloned().unwrap_or_default(),
            count,
            min_value: matched.iter().map(|m| m.value).fold(f64::INFINITY, f64::min),
            max_value: matched
                .iter()
                .map(|m| m.value)
                .fold(f64::NEG_INFINITY, f64::max),
            avg_value: if count > 0 { sum / count as f64 } else { 0.0 },
            std_dev: 0.0,
            earliest_time: matched.iter().map(|m| m.timestamp).min(),
            latest_time: matched.iter().map(|m| m.timestamp).max(),
            good_quality_count: matched
                .iter()
                .filter(|m| m.quality == QualityCode::Good)
                .count() as i64,
            bad_quality_count: matched
                .iter()
                .filter(|m| m.quality == QualityCode::Bad)
                .count() as i64,
        })
    }

    async fn delete_older_than(
        &self,
        ctx: &OpContext,
        threshold: DateTime<Utc>,
    ) -> GatewayResult<i64> {
        ctx.check()?;
        let mut measurements = self.measurements.lock().unwrap();
        let before = measurements.len();
        measurements.retain(|m| m.timestamp >= threshold);
        Ok((before - measurements.len()) as i64)
    }

    async fn delete_by_device(&self, ctx: &OpContext, device_id: &str) -> GatewayResult<i64> {
        ctx.check()?;
        let mut measurements = self.measurements.lock().unwrap();
        let before = measurements.len();
        measurements.retain(|m| m.device_id != device_id);
        Ok((before - measurements.len()) as i64)
    }

    async fn ensure_partition(&self, ctx: &OpContext, year: i32, month: u32) -> GatewayResult<()> {
        ctx.check()?;
        let mut partitions = self.partitions.lock().unwrap();
        if !partitions.contains(&(year, month)) {
            partitions.push((year, month));
        }
        Ok(())
    }
}

fn measurement_matches(m: &Measurement, filter: &MeasurementFilter) -> bool {
    if !filter.device_ids.is_empty() && !filter.device_ids.contains(&m.device_id) {
        return false;
    }
    if !filter.types.is_empty() && !filter.types.contains(&m.measurement_type) {
        return false;
    }
    if !filter.qualities.is_empty() && !filter.qualities.contains(&m.quality) {
        return false;
    }
    if let Some(batch_id) = &filter.batch_id {
        if m.batch_id.as_ref() != Some(batch_id) {
            return false;
        }
    }
    if let Some(start) = filter.time_range.start {
        if m.timestamp < start {
            return false;
        }
    }
    if let Some(end) = filter.time_range.end {
        if m.timestamp > end {
            return false;
        }
    }
    true
}

#[async_trait]
impl CommandRepository for InMemoryRepos {
    async fn create(&self, ctx: &OpContext, command: &Command) -> GatewayResult<()> {
        ctx.check()?;
        command.validate()?;
        let mut commands = self.commands.lock().unwrap();
        if commands.iter().any(|c| c.command_id == command.command_id) {
            return Err(GatewayError::AlreadyExists("command"));
        }
        commands.push(command.clone());
        Ok(())
    }

    async fn get_by_id(&self, ctx: &OpContext, id: &str) -> GatewayResult<Option<Command>> {
        ctx.check()?;
        Ok(self
            .commands
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == id)
            .cloned())
    }

    async fn get_by_command_id(
        &self,
        ctx: &OpContext,
        command_id: &str,
    ) -> GatewayResult<Option<Command>> {
        ctx.check()?;
        Ok(self
            .commands
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.command_id == command_id)
            .cloned())
    }

    async fn update(&self, ctx: &OpContext, command: &Command) -> GatewayResult<()> {
        ctx.check()?;
        let mut commands = self.commands.lock().unwrap();
        let slot = commands
            .iter_mut()
            .find(|c| c.command_id == command.command_id)
            .ok_or(GatewayError::NotFound("command"))?;
        *slot = command.clone();
        Ok(())
    }

    async fn delete(&self, ctx: &OpContext, id: &str) -> GatewayResult<()> {
        ctx.check()?;
        let mut commands = self.commands.lock().unwrap();
        let before = commands.len();
        commands.retain(|c| c.id != id);
        if commands.len() == before {
            return Err(GatewayError::NotFound("command"));
        }
        Ok(())
    }

    async fn list(&self, ctx: &OpContext, filter: &CommandFilter) -> GatewayResult<Vec<Command>> {
        ctx.check()?;
        let commands = self.commands.lock().unwrap();
        let matched: Vec<Command> = commands
            .iter()
            .filter(|c| {
                (filter.device_ids.is_empty() || filter.device_ids.contains(&c.device_id))
                    && (filter.statuses.is_empty() || filter.statuses.contains(&c.status))
                    && (filter.types.is_empty() || filter.types.contains(&c.command_type))
            })
            .cloned()
            .collect();
        Ok(page(&matched, filter.filter.offset, filter.filter.limit))
    }

    async fn count(&self, ctx: &OpContext, filter: &CommandFilter) -> GatewayResult<i64> {
        let listed = CommandRepository::list(self, ctx, filter).await?;
        Ok(listed.len() as i64)
    }

    async fn get_pending(&self, ctx: &OpContext, device_id: &str) -> GatewayResult<Vec<Command>> {
        ctx.check()?;
        let commands = self.commands.lock().unwrap();
        let mut pending: Vec<Command> = commands
            .iter()
            .filter(|c| {
                c.device_id == device_id && c.status == CommandStatus::Pending && !c.is_expired()
            })
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.submitted_at.cmp(&b.submitted_at))
        });
        Ok(pending)
    }

    async fn get_executing(
        &self,
        ctx: &OpContext,
        device_id: &str,
    ) -> GatewayResult<Vec<Command>> {
        ctx.check()?;
        Ok(self
            .commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.device_id == device_id && c.status == CommandStatus::Executing)
            .cloned()
            .collect())
    }

    async fn update_status(
        &self,
        ctx: &OpContext,
        command_id: &str,
        status: CommandStatus,
    ) -> GatewayResult<()> {
        ctx.check()?;
        let mut commands = self.commands.lock().unwrap();
        let command = commands
            .iter_mut()
            .find(|c| c.command_id == command_id)
            .ok_or(GatewayError::NotFound("command"))?;
        match status {
            CommandStatus::Executing => command.start_execution(),
            CommandStatus::Timeout => command.mark_timeout(),
            other => {
                command.status = other;
                command.updated_at = Utc::now();
                if other.is_terminal() {
                    command.completed_at = Some(Utc::now());
                }
            }
        }
        Ok(())
    }

    async fn get_expired(&self, ctx: &OpContext) -> GatewayResult<Vec<Command>> {
        ctx.check()?;
        Ok(self
            .commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| {
                matches!(
                    c.status,
                    CommandStatus::Pending | CommandStatus::Executing
                ) && c.is_expired()
            })
            .cloned()
            .collect())
    }

    async fn mark_expired_as_timeout(&self, ctx: &OpContext) -> GatewayResult<Vec<Command>> {
        ctx.check()?;
        let mut commands = self.commands.lock().unwrap();
        let mut transitioned = Vec::new();
        for command in commands.iter_mut() {
            if matches!(
                command.status,
                CommandStatus::Pending | CommandStatus::Executing
            ) && command.is_expired()
            {
                command.mark_timeout();
                transitioned.push(command.clone());
            }
        }
        Ok(transitioned)
    }

    async fn delete_completed_older_than(
        &self,
        ctx: &OpContext,
        threshold: DateTime<Utc>,
    ) -> GatewayResult<i64> {
        ctx.check()?;
        let mut commands = self.commands.lock().unwrap();
        let before = commands.len();
        commands.retain(|c| {
            !(c.status.is_terminal() && c.completed_at.map(|at| at < threshold).unwrap_or(false))
        });
        Ok((before - commands.len()) as i64)
    }

    async fn get_command_stats(
        &self,
        ctx: &OpContext,
        device_id: &str,
        _range: &TimeRange,
    ) -> GatewayResult<HashMap<CommandStatus, i64>> {
        ctx.check()?;
        let commands = self.commands.lock().unwrap();
        let mut stats = HashMap::new();
        for command in commands.iter().filter(|c| c.device_id == device_id) {
            *stats.entry(command.status).or_insert(0) += 1;
        }
        Ok(stats)
    }
}

#[async_trait]
impl AlertRepository for InMemoryRepos {
    async fn create(&self, ctx: &OpContext, alert: &Alert) -> GatewayResult<()> {
        ctx.check()?;
        alert.validate()?;
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }

    async fn get_by_id(&self, ctx: &OpContext, id: &str) -> GatewayResult<Option<Alert>> {
        ctx.check()?;
        Ok(self
            .alerts
            .lock()
            .unwrap()
            .iter()
            .find(|a| a.id == id)
            .cloned())
    }

    async fn update(&self, ctx: &OpContext, alert: &Alert) -> GatewayResult<()> {
        ctx.check()?;
        let mut alerts = self.alerts.lock().unwrap();
        let slot = alerts
            .iter_mut()
            .find(|a| a.id == alert.id)
            .ok_or(GatewayError::NotFound("alert"))?;
        *slot = alert.clone();
        Ok(())
    }

    async fn delete(&self, ctx: &OpContext, id: &str) -> GatewayResult<()> {
        ctx.check()?;
        let mut alerts = self.alerts.lock().unwrap();
        let before = alerts.len();
        alerts.retain(|a| a.id != id);
        if alerts.len() == before {
            return Err(GatewayError::NotFound("alert"));
        }
        Ok(())
    }

    async fn list(&self, ctx: &OpContext, filter: &AlertFilter) -> GatewayResult<Vec<Alert>> {
        ctx.check()?;
        let alerts = self.alerts.lock().unwrap();
        let matched: Vec<Alert> = alerts
            .iter()
            .filter(|a| alert_matches(a, filter))
            .cloned()
            .collect();
        Ok(page(&matched, filter.filter.offset, filter.filter.limit))
    }

    async fn count(&self, ctx: &OpContext, filter: &AlertFilter) -> GatewayResult<i64> {
        ctx.check()?;
        let alerts = self.alerts.lock().unwrap();
        Ok(alerts.iter().filter(|a| alert_matches(a, filter)).count() as i64)
    }

    async fn acknowledge(
        &self,
        ctx: &OpContext,
        alert_id: &str,
        acknowledged_by: &str,
    ) -> GatewayResult<()> {
        ctx.check()?;
        let mut alerts = self.alerts.lock().unwrap();
        let alert = alerts
            .iter_mut()
            .find(|a| a.id == alert_id)
            .ok_or(GatewayError::NotFound("alert"))?;
        alert.acknowledge(acknowledged_by);
        Ok(())
    }

    async fn resolve(&self, ctx: &OpContext, alert_id: &str) -> GatewayResult<()> {
        ctx.check()?;
        let mut alerts = self.alerts.lock().unwrap();
        let alert = alerts
            .iter_mut()
            .find(|a| a.id == alert_id)
            .ok_or(GatewayError::NotFound("alert"))?;
        alert.resolve();
        Ok(())
    }

    async fn get_unacknowledged(&self, ctx: &OpContext) -> GatewayResult<Vec<Alert>> {
        let filter = AlertFilter {
            acknowledged: Some(false),
            ..AlertFilter::default()
        };
        AlertRepository::list(self, ctx, &filter).await
    }

    async fn get_unresolved(&self, ctx: &OpContext) -> GatewayResult<Vec<Alert>> {
        let filter = AlertFilter {
            resolved: Some(false),
            ..AlertFilter::default()
        };
        AlertRepository::list(self, ctx, &filter).await
    }

    async fn get_critical(&self, ctx: &OpContext) -> GatewayResult<Vec<Alert>> {
        let filter = AlertFilter {
            severities: vec![AlertSeverity::Critical],
            resolved: Some(false),
            ..AlertFilter::default()
        };
        AlertRepository::list(self, ctx, &filter).await
    }

    async fn get_alert_stats(
        &self,
        ctx: &OpContext,
        _range: &TimeRange,
    ) -> GatewayResult<HashMap<AlertSeverity, i64>> {
        ctx.check()?;
        let alerts = self.alerts.lock().unwrap();
        let mut stats = HashMap::new();
        for alert in alerts.iter() {
            *stats.entry(alert.severity).or_insert(0) += 1;
        }
        Ok(stats)
    }

    async fn get_alerts_by_device(
        &self,
        ctx: &OpContext,
        device_id: &str,
        limit: i64,
    ) -> GatewayResult<Vec<Alert>> {
        let filter = AlertFilter {
            device_ids: vec![device_id.to_string()],
            filter: labgw_storage::Filter {
                limit,
                ..labgw_storage::Filter::default()
            },
            ..AlertFilter::default()
        };
        AlertRepository::list(self, ctx, &filter).await
    }

    async fn delete_resolved_older_than(
        &self,
        ctx: &OpContext,
        threshold: DateTime<Utc>,
    ) -> GatewayResult<i64> {
        ctx.check()?;
        let mut alerts = self.alerts.lock().unwrap();
        let before = alerts.len();
        alerts.retain(|a| !a.resolved_at.map(|at| at < threshold).unwrap_or(false));
        Ok((before - alerts.len()) as i64)
    }
}

fn alert_matches(alert: &Alert, filter: &AlertFilter) -> bool {
    if !filter.device_ids.is_empty() {
        match &alert.device_id {
            Some(id) if filter.device_ids.contains(id) => {}
            _ => return false,
        }
    }
    if !filter.types.is_empty() && !filter.types.contains(&alert.alert_type) {
        return false;
    }
    if !filter.severities.is_empty() && !filter.severities.contains(&alert.severity) {
        return false;
    }
    if let Some(acknowledged) = filter.acknowledged {
        if alert.acknowledged != acknowledged {
            return false;
        }
    }
    if let Some(resolved) = filter.resolved {
        if alert.is_resolved() != resolved {
            return false;
        }
    }
    true
}

#[async_trait]
impl SessionStore for InMemoryRepos {
    async fn create(&self, ctx: &OpContext, session: &DeviceSession) -> GatewayResult<()> {
        ctx.check()?;
        self.sessions.lock().unwrap().push(session.clone());
        Ok(())
    }

    async fn get_by_session_id(
        &self,
        ctx: &OpContext,
        session_id: &str,
    ) -> GatewayResult<Option<DeviceSession>> {
        ctx.check()?;
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.session_id == session_id)
            .cloned())
    }

    async fn get_active_for_device(
        &self,
        ctx: &OpContext,
        device_id: &str,
    ) -> GatewayResult<Option<DeviceSession>> {
        ctx.check()?;
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.device_id == device_id && s.is_active)
            .cloned())
    }

    async fn deactivate(
        &self,
        ctx: &OpContext,
        session_id: &str,
        _reason: &str,
    ) -> GatewayResult<()> {
        ctx.check()?;
        let mut sessions = self.sessions.lock().unwrap();
        for session in sessions.iter_mut() {
            if session.session_id == session_id {
                session.is_active = false;
            }
        }
        Ok(())
    }

    async fn supersede_and_create(
        &self,
        ctx: &OpContext,
        session: &DeviceSession,
    ) -> GatewayResult<()> {
        ctx.check()?;
        let mut sessions = self.sessions.lock().unwrap();
        for existing in sessions.iter_mut() {
            if existing.device_id == session.device_id && existing.is_active {
                existing.is_active = false;
            }
        }
        sessions.push(session.clone());
        Ok(())
    }

    async fn attach_stream(
        &self,
        ctx: &OpContext,
        session_id: &str,
        stream_id: &str,
    ) -> GatewayResult<()> {
        ctx.check()?;
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .iter_mut()
            .find(|s| s.session_id == session_id && s.is_active)
            .ok_or(GatewayError::NotFound("session"))?;
        session.stream_id = Some(stream_id.to_string());
        Ok(())
    }

    async fn update_heartbeat(
        &self,
        ctx: &OpContext,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> GatewayResult<()> {
        ctx.check()?;
        let mut sessions = self.sessions.lock().unwrap();
        for session in sessions.iter_mut() {
            if session.session_id == session_id && session.is_active {
                session.last_heartbeat = at;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RepositoryManager for InMemoryRepos {
    fn device(&self) -> &dyn DeviceRepository {
        self
    }

    fn measurement(&self) -> &dyn MeasurementRepository {
        self
    }

    fn command(&self) -> &dyn CommandRepository {
        self
    }

    fn alert(&self) -> &dyn AlertRepository {
        self
    }

    fn session(&self) -> &dyn SessionStore {
        self
    }

    async fn health_check(&self, ctx: &OpContext) -> GatewayResult<()> {
        ctx.check()?;
        if self.fail_health.load(Ordering::SeqCst) {
            return Err(GatewayError::unavailable_transient("health probe failed"));
        }
        Ok(())
    }

    async fn close(&self) -> GatewayResult<()> {
        Ok(())
    }
}
