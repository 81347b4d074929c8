//! Session: save, load and delete against one driver.

use std::sync::Arc;

use ogm_core::{
    EventKind, EventListener, EventSubject, MappingError, NativeId, OgmConfig, OgmError,
    PersistenceEvent, Result, SessionConfig, SessionId,
};
use ogm_mapping::statement::DeleteRow;
use ogm_mapping::{
    execute, CompiledBatch, Compiler, CountRequest, Driver, GraphEntityMapper, IdMap,
    LoadRequest, MappingContext, NodeEntry, SaveSummary, Statement, Transaction,
};
use ogm_metadata::{Entity, EntityRef, MetaData, SchemaDescriptor};

/// Hands out sessions that share one driver and one metadata registry.
#[derive(Clone)]
pub struct SessionFactory<D: Driver + Clone> {
    driver: D,
    metadata: Arc<MetaData>,
    config: OgmConfig,
}

impl<D: Driver + Clone> SessionFactory<D> {
    pub fn new(driver: D, metadata: MetaData, config: OgmConfig) -> Self {
        Self {
            driver,
            metadata: Arc::new(metadata),
            config,
        }
    }

    pub fn open_session(&self) -> Session<D> {
        Session::new(self.driver.clone(), Arc::clone(&self.metadata), &self.config)
    }

    pub fn metadata(&self) -> &MetaData {
        &self.metadata
    }
}

/// One unit of work.
///
/// The session remembers every entity it has saved or loaded, so saving an
/// unchanged graph writes nothing and loading a node twice returns the same
/// instance. Methods take `&mut self`; a session is never shared between
/// concurrent tasks.
pub struct Session<D: Driver> {
    id: SessionId,
    driver: D,
    metadata: Arc<MetaData>,
    context: MappingContext,
    config: SessionConfig,
    listeners: Vec<Arc<dyn EventListener>>,
}

impl<D: Driver> Session<D> {
    pub fn new(driver: D, metadata: Arc<MetaData>, config: &OgmConfig) -> Self {
        let id = SessionId::new();
        tracing::debug!(session = %id, "Opened session");
        Self {
            id,
            driver,
            metadata,
            context: MappingContext::new(),
            config: config.session.clone(),
            listeners: Vec::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn metadata(&self) -> &MetaData {
        &self.metadata
    }

    pub fn context(&self) -> &MappingContext {
        &self.context
    }

    pub fn register_listener(&mut self, listener: Arc<dyn EventListener>) {
        self.listeners.push(listener);
    }

    // ── Save ─────────────────────────────────────────────────────

    /// Save `entity` and everything reachable from it, up to the configured
    /// default depth.
    pub async fn save<T: Send + Sync + 'static>(
        &mut self,
        entity: &Entity<T>,
    ) -> Result<SaveSummary> {
        let depth = self.config.default_save_depth;
        self.save_with_depth(entity, depth).await
    }

    /// Save `entity` and everything within `depth` relationships of it.
    /// `-1` walks the whole reachable graph; `0` writes only the entity.
    pub async fn save_with_depth<T: Send + Sync + 'static>(
        &mut self,
        entity: &Entity<T>,
        depth: i32,
    ) -> Result<SaveSummary> {
        self.save_all(&[EntityRef::new(entity)], depth).await
    }

    /// Save several roots as one batch in one transaction.
    pub async fn save_all(&mut self, roots: &[EntityRef], depth: i32) -> Result<SaveSummary> {
        let batch = self.compile(roots, depth)?;
        if batch.is_empty() {
            tracing::debug!(session = %self.id, "Nothing to save");
            return Ok(SaveSummary::default());
        }

        for subject in batch.pending() {
            self.emit(EventKind::PreSave, subject);
        }

        let mut txn = self.driver.begin().await?;
        let outcome = match execute(&mut txn, batch.statements()).await {
            Ok(ids) => batch.validate(&ids).map(|()| ids).map_err(OgmError::from),
            Err(e) => Err(e),
        };
        let ids = finish(txn, outcome).await?;

        let summary = batch.apply(&mut self.context, &ids)?;
        for subject in &summary.written {
            self.emit(EventKind::PostSave, subject.clone());
        }
        tracing::info!(
            session = %self.id,
            statements = summary.statements,
            nodes_created = summary.nodes_created,
            nodes_updated = summary.nodes_updated,
            relationships_created = summary.relationships_created,
            relationships_updated = summary.relationships_updated,
            relationships_deleted = summary.relationships_deleted,
            "Saved"
        );
        Ok(summary)
    }

    /// Compile a save without running it.
    pub fn compile(&self, roots: &[EntityRef], depth: i32) -> Result<CompiledBatch> {
        Ok(Compiler::new(&self.metadata, &self.context).compile(roots, depth)?)
    }

    // ── Load ─────────────────────────────────────────────────────

    /// Load the node or relationship entity of type `T` with native id
    /// `id`, with its neighbourhood up to the configured default depth.
    pub async fn load<T: Send + Sync + 'static>(
        &mut self,
        id: NativeId,
    ) -> Result<Option<Entity<T>>> {
        let depth = self.config.default_load_depth;
        self.load_with_depth(id, depth).await
    }

    pub async fn load_with_depth<T: Send + Sync + 'static>(
        &mut self,
        id: NativeId,
        depth: i32,
    ) -> Result<Option<Entity<T>>> {
        let mut loaded = self.load_all::<T>(&[id], depth).await?;
        Ok(loaded.pop())
    }

    /// Load the entities of type `T` with the given ids, in the order asked
    /// for. Ids with no entity of type `T` are left out. For relationship
    /// entities, `depth` counts from both endpoints.
    pub async fn load_all<T: Send + Sync + 'static>(
        &mut self,
        ids: &[NativeId],
        depth: i32,
    ) -> Result<Vec<Entity<T>>> {
        let descriptor = self.descriptor_of::<T>()?;
        let request = match descriptor.rel_type() {
            Some(rel_type) => LoadRequest::RelationshipsByIds {
                rel_type: rel_type.to_string(),
                ids: ids.to_vec(),
                depth,
            },
            None => LoadRequest::ByIds {
                labels: descriptor.labels().to_vec(),
                ids: ids.to_vec(),
                depth,
            },
        };
        let roots = self.fetch(&request).await?;
        let relationships = request.is_relationship_load();
        let context = &self.context;
        Ok(ids
            .iter()
            .filter(|id| roots.contains(*id))
            .filter_map(|id| {
                if relationships {
                    context.relationship_entity(*id).map(|entry| &entry.instance)
                } else {
                    context.get(*id)
                }
            })
            .filter_map(|instance| instance.downcast::<T>())
            .collect())
    }

    /// Load every node of type `T`.
    pub async fn load_all_by_type<T: Send + Sync + 'static>(
        &mut self,
        depth: i32,
    ) -> Result<Vec<Entity<T>>> {
        let descriptor = self.node_descriptor::<T>()?;
        let request = LoadRequest::ByLabels {
            labels: descriptor.labels().to_vec(),
            depth,
        };
        let roots = self.fetch(&request).await?;
        Ok(roots
            .iter()
            .filter_map(|id| self.context.get(*id))
            .filter_map(|instance| instance.downcast::<T>())
            .collect())
    }

    /// Run `request` and map the response into the context. Returns the
    /// root ids the driver reported.
    async fn fetch(&mut self, request: &LoadRequest) -> Result<Vec<NativeId>> {
        let response = self.driver.fetch(request).await?;
        let mut mapper = GraphEntityMapper::new(&self.metadata, &mut self.context);
        if request.is_relationship_load() {
            mapper.map_relationship_entities(&response)?;
        } else {
            mapper.map(&response)?;
        }
        tracing::info!(
            session = %self.id,
            roots = response.roots.len(),
            nodes = response.nodes.len(),
            relationships = response.relationships.len(),
            "Loaded"
        );
        Ok(response.roots)
    }

    /// Number of stored nodes of type `T`, or of relationships of a
    /// relationship entity's type.
    pub async fn count_entities_of_type<T: Send + Sync + 'static>(&self) -> Result<u64> {
        let descriptor = self.descriptor_of::<T>()?;
        let request = match descriptor.rel_type() {
            Some(rel_type) => CountRequest::Relationships {
                rel_type: rel_type.to_string(),
            },
            None => CountRequest::Nodes {
                labels: descriptor.labels().to_vec(),
            },
        };
        Ok(self.driver.count(&request).await?)
    }

    // ── Delete ───────────────────────────────────────────────────

    /// Delete `entity` from the database. A node is removed together with
    /// its relationships; a relationship entity is removed by id. The
    /// instance is forgotten and its identity cleared, so saving it again
    /// creates it afresh. Entities that were never saved are ignored.
    ///
    /// Known neighbours lose a relationship, so they are reported as saved
    /// around the delete.
    pub async fn delete<T: Send + Sync + 'static>(&mut self, entity: &Entity<T>) -> Result<()> {
        let instance = EntityRef::new(entity);
        let descriptor = self.descriptor_for(&instance)?;
        let Some(id) = descriptor.identity().read(&instance)? else {
            tracing::debug!(type_name = descriptor.name(), "Delete of unsaved entity ignored");
            return Ok(());
        };
        let expected_version = match descriptor.version() {
            Some(attribute) => attribute.read(&instance)?,
            None => None,
        };
        let version = descriptor
            .version()
            .filter(|_| expected_version.is_some())
            .map(|attribute| attribute.name().to_string());
        let rows = vec![DeleteRow {
            id,
            expected_version,
        }];
        let statement = if descriptor.is_relationship_entity() {
            Statement::DeleteRelationshipEntities { version, rows }
        } else {
            Statement::DeleteNodes { version, rows }
        };

        let subject = EventSubject {
            type_name: descriptor.name().to_string(),
            native_id: Some(id),
        };
        let affected = if descriptor.is_relationship_entity() {
            self.context.endpoints(id)
        } else {
            self.context.neighbours(id)
        };
        let neighbours: Vec<EventSubject> = affected.into_iter().map(node_subject).collect();

        for neighbour in &neighbours {
            self.emit(EventKind::PreSave, neighbour.clone());
        }
        self.emit(EventKind::PreDelete, subject.clone());
        self.write(&[statement]).await?;
        self.context.reset(&instance, &descriptor)?;
        self.emit(EventKind::PostDelete, subject);
        for neighbour in neighbours {
            self.emit(EventKind::PostSave, neighbour);
        }
        tracing::info!(session = %self.id, type_name = descriptor.name(), id, "Deleted");
        Ok(())
    }

    /// Delete every node of type `T` (with its relationships), or every
    /// relationship of a relationship entity's type.
    pub async fn delete_all_of_type<T: Send + Sync + 'static>(&mut self) -> Result<()> {
        let descriptor = self.descriptor_of::<T>()?;
        let (statement, forgotten) = if let Some(rel_type) = descriptor.rel_type() {
            let forgotten: Vec<_> = self
                .context
                .relationship_entities()
                .filter(|entry| entry.rel_type == rel_type)
                .map(|entry| (entry.instance.clone(), Arc::clone(&entry.descriptor)))
                .collect();
            let statement = Statement::DeleteRelationshipsByType {
                rel_type: rel_type.to_string(),
            };
            (statement, forgotten)
        } else {
            let label = descriptor
                .labels()
                .first()
                .cloned()
                .unwrap_or_else(|| descriptor.name().to_string());
            let forgotten: Vec<_> = self
                .context
                .nodes()
                .filter(|entry| entry.descriptor.labels().contains(&label))
                .map(|entry| (entry.instance.clone(), Arc::clone(&entry.descriptor)))
                .collect();
            (Statement::DeleteNodesByLabel { label }, forgotten)
        };

        self.write(&[statement]).await?;

        if let Some(rel_type) = descriptor.rel_type() {
            let plain: Vec<_> = self
                .context
                .edges()
                .filter(|edge| edge.rel_type == rel_type)
                .cloned()
                .collect();
            for edge in &plain {
                self.context.remove_edge(edge);
            }
        }
        for (instance, entity_descriptor) in &forgotten {
            self.context.reset(instance, entity_descriptor)?;
        }
        tracing::info!(
            session = %self.id,
            type_name = descriptor.name(),
            forgotten = forgotten.len(),
            "Deleted all of type"
        );
        Ok(())
    }

    /// Remove every node and relationship from the database and empty the
    /// context.
    pub async fn purge_database(&mut self) -> Result<()> {
        self.write(&[Statement::Purge]).await?;
        self.context.clear();
        tracing::info!(session = %self.id, "Purged database");
        Ok(())
    }

    // ── Context ──────────────────────────────────────────────────

    /// Forget everything this session has seen. Instances already handed
    /// out keep their identities.
    pub fn clear(&mut self) {
        self.context.clear();
    }

    /// Forget one node, its edges and the relationship entities attached to
    /// it. The next save treats the node's relationships as unknown.
    pub fn detach_node(&mut self, id: NativeId) -> bool {
        self.context.forget(id).is_some()
    }

    /// Forget one relationship entity. Its endpoint nodes stay known.
    pub fn detach_relationship_entity(&mut self, id: NativeId) -> bool {
        self.context.forget_relationship_entity(id).is_some()
    }

    // ── Internals ────────────────────────────────────────────────

    async fn write(&self, statements: &[Statement]) -> Result<IdMap> {
        let mut txn = self.driver.begin().await?;
        let outcome = execute(&mut txn, statements).await;
        finish(txn, outcome).await
    }

    fn emit(&self, kind: EventKind, subject: EventSubject) {
        if !self.config.events_enabled || self.listeners.is_empty() {
            return;
        }
        let event = PersistenceEvent::new(self.id, kind, subject);
        for listener in &self.listeners {
            listener.on_event(&event);
        }
    }

    fn descriptor_of<T: Send + Sync + 'static>(&self) -> Result<Arc<SchemaDescriptor>> {
        self.metadata
            .descriptor_of::<T>()
            .cloned()
            .ok_or_else(|| unknown_type(std::any::type_name::<T>()))
    }

    fn node_descriptor<T: Send + Sync + 'static>(&self) -> Result<Arc<SchemaDescriptor>> {
        let descriptor = self.descriptor_of::<T>()?;
        if descriptor.is_relationship_entity() {
            return Err(MappingError::TypeMismatch {
                type_name: descriptor.name().to_string(),
            }
            .into());
        }
        Ok(descriptor)
    }

    fn descriptor_for(&self, instance: &EntityRef) -> Result<Arc<SchemaDescriptor>> {
        self.metadata
            .descriptor_for(instance)
            .cloned()
            .ok_or_else(|| unknown_type(instance.type_name()))
    }
}

fn node_subject(entry: &NodeEntry) -> EventSubject {
    EventSubject {
        type_name: entry.descriptor.name().to_string(),
        native_id: Some(entry.id),
    }
}

fn unknown_type(type_name: &str) -> OgmError {
    MappingError::UnknownType {
        type_name: type_name.to_string(),
    }
    .into()
}

/// Commit on success; otherwise roll back and return the original error.
async fn finish<T: Transaction>(txn: T, outcome: Result<IdMap>) -> Result<IdMap> {
    match outcome {
        Ok(ids) => {
            txn.commit().await?;
            Ok(ids)
        }
        Err(err) => {
            if let Err(rollback) = txn.rollback().await {
                tracing::warn!(error = %rollback, "Rollback failed");
            }
            Err(err)
        }
    }
}
