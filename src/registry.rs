use serde::{Deserialize, Serialize};
use thiserror::Error;
use worker_client::message::{
    validate_instances, validate_plugins, ErrorRecord, InstanceRecord, PluginKind, PluginRecord,
    WILDCARD_FAMILY,
};
use worker_client::WorkerError;

#[derive(Error, Debug, PartialEq)]
pub enum RegistryError {
    #[error("no instance named `{0}`")]
    UnknownInstance(String),

    #[error("no plugin named `{0}`")]
    UnknownPlugin(String),

    /// The host disabled the plugin; it cannot take part in a run.
    #[error("plugin `{0}` is not active on this host")]
    PluginInactive(String),

    #[error("plugin `{0}` is not optional")]
    PluginRequired(String),
}

/// A unit of work, as held during a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub name: String,
    pub family: String,
    pub families: Vec<String>,
    pub toggled: bool,
    pub selected: bool,
    pub progress: f64,
    pub processing: bool,
    pub has_error: bool,
    pub errors: Vec<ErrorRecord>,
}

impl Instance {
    fn from_record(record: InstanceRecord) -> Self {
        Self {
            toggled: record.publish.unwrap_or(true),
            name: record.name,
            family: record.family,
            families: record.families,
            selected: false,
            progress: 0.0,
            processing: false,
            has_error: false,
            errors: vec![],
        }
    }

    /// Primary family followed by the extra tags.
    pub fn all_families(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.family.as_str()).chain(self.families.iter().map(String::as_str))
    }
}

/// An ordered processing stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plugin {
    pub name: String,
    pub kind: PluginKind,
    pub order: f64,
    pub toggled: bool,
    pub active: bool,
    pub optional: bool,
    pub families: Vec<String>,
    pub compatible: bool,
    pub selected: bool,
    pub progress: f64,
    pub processing: bool,
}

impl Plugin {
    fn from_record(record: PluginRecord) -> Self {
        Self {
            toggled: record.active,
            name: record.name,
            kind: record.kind,
            order: record.order,
            active: record.active,
            optional: record.optional,
            families: record.families,
            compatible: true,
            selected: false,
            progress: 0.0,
            processing: false,
        }
    }

    pub fn is_compatible_with(&self, instance: &Instance) -> bool {
        self.families.iter().any(|family| {
            family == WILDCARD_FAMILY || instance.all_families().any(|f| f == family)
        })
    }
}

/// Both collections the engine walks: instances and plugins, the latter
/// sorted by `order`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Registry {
    instances: Vec<Instance>,
    plugins: Vec<Plugin>,
}

impl Registry {
    /// Build a registry from what the host reported.
    ///
    /// Selectors are dropped, plugins are stable-sorted by `order` so ties
    /// keep the host's order, and inactive plugins start untoggled.
    pub fn populate(
        instances: Vec<InstanceRecord>,
        plugins: Vec<PluginRecord>,
    ) -> Result<Self, WorkerError> {
        validate_instances(&instances)?;
        validate_plugins(&plugins)?;

        let instances = instances.into_iter().map(Instance::from_record).collect();
        let mut plugins: Vec<Plugin> = plugins
            .into_iter()
            .filter(|p| p.kind != PluginKind::Selector)
            .map(Plugin::from_record)
            .collect();
        plugins.sort_by(|a, b| a.order.total_cmp(&b.order));

        let mut registry = Self { instances, plugins };
        registry.refresh_compatibility();
        Ok(registry)
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn plugins(&self) -> &[Plugin] {
        &self.plugins
    }

    pub fn instance(&self, index: usize) -> Option<&Instance> {
        self.instances.get(index)
    }

    pub fn plugin(&self, index: usize) -> Option<&Plugin> {
        self.plugins.get(index)
    }

    pub(crate) fn instance_mut(&mut self, index: usize) -> Option<&mut Instance> {
        self.instances.get_mut(index)
    }

    pub(crate) fn plugin_mut(&mut self, index: usize) -> Option<&mut Plugin> {
        self.plugins.get_mut(index)
    }

    pub fn instance_index(&self, name: &str) -> Option<usize> {
        self.instances.iter().position(|i| i.name == name)
    }

    pub fn plugin_index(&self, name: &str) -> Option<usize> {
        self.plugins.iter().position(|p| p.name == name)
    }

    pub fn instance_toggles(&self) -> Vec<bool> {
        self.instances.iter().map(|i| i.toggled).collect()
    }

    pub fn plugin_toggles(&self) -> Vec<bool> {
        self.plugins.iter().map(|p| p.toggled).collect()
    }

    pub fn toggled_instance_count(&self) -> usize {
        self.instances.iter().filter(|i| i.toggled).count()
    }

    pub fn toggled_plugin_count(&self) -> usize {
        self.plugins.iter().filter(|p| p.toggled).count()
    }

    pub fn toggle_instance(&mut self, name: &str, toggled: bool) -> Result<(), RegistryError> {
        let instance = self
            .instances
            .iter_mut()
            .find(|i| i.name == name)
            .ok_or_else(|| RegistryError::UnknownInstance(name.to_string()))?;
        instance.toggled = toggled;
        self.refresh_compatibility();
        Ok(())
    }

    pub fn toggle_plugin(&mut self, name: &str, toggled: bool) -> Result<(), RegistryError> {
        let plugin = self
            .plugins
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| RegistryError::UnknownPlugin(name.to_string()))?;
        if toggled && !plugin.active {
            return Err(RegistryError::PluginInactive(name.to_string()));
        }
        if !toggled && !plugin.optional {
            return Err(RegistryError::PluginRequired(name.to_string()));
        }
        plugin.toggled = toggled;
        Ok(())
    }

    /// UI focus. Has no bearing on what runs.
    pub fn select_instance(&mut self, name: &str) -> Result<(), RegistryError> {
        let index = self
            .instance_index(name)
            .ok_or_else(|| RegistryError::UnknownInstance(name.to_string()))?;
        for (i, instance) in self.instances.iter_mut().enumerate() {
            instance.selected = i == index;
        }
        Ok(())
    }

    /// Mark every plugin that matches at least one toggled instance.
    pub fn refresh_compatibility(&mut self) {
        let toggled: Vec<&Instance> = self.instances.iter().filter(|i| i.toggled).collect();
        for plugin in self.plugins.iter_mut() {
            plugin.compatible = toggled.iter().any(|i| plugin.is_compatible_with(i));
        }
    }

    /// Wipe everything a previous run left behind.
    pub fn reset_progress(&mut self) {
        for instance in self.instances.iter_mut() {
            instance.progress = 0.0;
            instance.processing = false;
            instance.has_error = false;
            instance.errors.clear();
        }
        for plugin in self.plugins.iter_mut() {
            plugin.progress = 0.0;
            plugin.processing = false;
        }
    }

    pub(crate) fn clear_processing(&mut self) {
        self.instances.iter_mut().for_each(|i| i.processing = false);
        self.plugins.iter_mut().for_each(|p| p.processing = false);
    }

    /// Number of toggled entries at or before `index`.
    pub(crate) fn toggled_instances_through(&self, index: usize) -> usize {
        self.instances.iter().take(index + 1).filter(|i| i.toggled).count()
    }

    pub(crate) fn toggled_plugins_through(&self, index: usize) -> usize {
        self.plugins.iter().take(index + 1).filter(|p| p.toggled).count()
    }
}
