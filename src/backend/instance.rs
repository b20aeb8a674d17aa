// Instance context - Vulkan entry point and presentation surface
//
// Responsibilities:
// - Load the Vulkan library and create the instance
// - Validation layer hookup (only when requested, fatal if missing)
// - Debug messenger routing validation output into `log`
// - Presentation surface for the window supplied by the surface provider

use anyhow::{Context, Result};
use ash::{vk, Entry};
use std::ffi::{c_char, CStr, CString};

use crate::config::Config;
use crate::error::{vk_check, EngineError};
use crate::surface::SurfaceProvider;

pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Decide whether validation can be enabled given the installed layers.
///
/// Unavailable layers are fatal only when validation was asked for.
pub fn resolve_validation(
    requested: bool,
    available: &[vk::LayerProperties],
) -> Result<bool, EngineError> {
    if !requested {
        return Ok(false);
    }

    let found = available.iter().any(|layer| {
        let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
        name == VALIDATION_LAYER
    });

    if found {
        Ok(true)
    } else {
        Err(EngineError::ValidationUnavailable(
            VALIDATION_LAYER.to_string_lossy().into_owned(),
        ))
    }
}

/// Owns the instance-level handles. Everything else borrows from it through
/// an `Arc`, so the instance is destroyed last.
pub struct InstanceContext {
    pub entry: Entry,
    pub instance: ash::Instance,
    pub surface_loader: ash::extensions::khr::Surface,
    pub surface: vk::SurfaceKHR,
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl InstanceContext {
    pub fn new(config: &Config, surface_provider: &dyn SurfaceProvider) -> Result<Self> {
        log::info!("Creating Vulkan instance: {}", config.engine.application_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Figure out whether validation is usable
        let layers = vk_check("vkEnumerateInstanceLayerProperties", unsafe {
            entry.enumerate_instance_layer_properties()
        })?;
        let enable_validation = resolve_validation(config.debug.validation_layers, &layers)?;
        log::info!(
            "Validation layers: {}",
            if enable_validation { "enabled" } else { "disabled" }
        );

        // Step 3: Create instance
        let (display_handle, window_handle) = surface_provider.raw_handles();
        let instance = Self::create_instance(&entry, config, display_handle, enable_validation)?;

        // Step 4: Debug messenger
        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        // Step 5: Surface
        let surface_loader = ash::extensions::khr::Surface::new(&entry, &instance);
        let surface = vk_check("vkCreateSurfaceKHR", unsafe {
            ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
        })
        .context("Failed to create window surface")?;

        Ok(Self {
            entry,
            instance,
            surface_loader,
            surface,
            debug_utils,
        })
    }

    pub fn validation_enabled(&self) -> bool {
        self.debug_utils.is_some()
    }

    fn create_instance(
        entry: &Entry,
        config: &Config,
        display_handle: raw_window_handle::RawDisplayHandle,
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name = CString::new(config.engine.application_name.as_str())?;
        let engine_name = CString::new(config.engine.engine_name.as_str())?;
        let (major, minor, patch) = config.engine.application_version;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, major, minor, patch))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_0);

        let mut extensions: Vec<*const c_char> = vk_check("vkEnumerateInstanceExtensionProperties", {
            ash_window::enumerate_required_extensions(display_handle)
        })
        .context("Window system has no Vulkan surface support")?
        .to_vec();

        if enable_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = vk_check("vkCreateInstance", unsafe {
            entry.create_instance(&create_info, None)
        })?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = vk_check("vkCreateDebugUtilsMessengerEXT", unsafe {
            debug_utils.create_debug_utils_messenger(&create_info, None)
        })?;

        Ok((debug_utils, messenger))
    }
}

impl Drop for InstanceContext {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan instance...");

        unsafe {
            self.surface_loader.destroy_surface(self.surface, None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
