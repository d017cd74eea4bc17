//! Resolution of the TPM resources that policy assertions refer to.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::connection::{ResourceContext, SessionContext, TpmConnection};
use crate::error::{PolicyError, TpmError};
use crate::params::{PolicyExecuteParams, PolicySessionUsage};
use crate::policy::Policy;
use crate::tpm_structure::TpmEnum;
use crate::tpm_type_extensions::{name_alg, name_handle};
use crate::tpm_types::*;

const PERSISTENT_FIRST: u32 = 0x81000000;
const NV_INDEX_FIRST: u32 = 0x01000000;
const MAX_CAPABILITY_HANDLES: u32 = 0xFFFF;

fn flush(tpm: &dyn TpmConnection, handle: TPM_HANDLE) {
    debug!("flushing {}", handle);
    if let Err(e) = tpm.flush_context(handle) {
        warn!("cannot flush context for {}: {}", handle, e);
    }
}

/// A resource returned from a [`PolicyResourceLoader`]. Transient resources are
/// flushed from the TPM when this is dropped.
pub struct LoadedResource<'t> {
    pub context: ResourceContext,
    /// The policy that authorizes use of this resource, if it is known.
    pub policy: Option<Policy>,
    flush: Option<&'t dyn TpmConnection>,
}

impl<'t> LoadedResource<'t> {
    /// A resource that stays loaded after use.
    pub fn new(context: ResourceContext, policy: Option<Policy>) -> Self {
        Self { context, policy, flush: None }
    }

    /// A resource that was loaded for this use only.
    pub fn transient(context: ResourceContext, policy: Option<Policy>, tpm: &'t dyn TpmConnection) -> Self {
        Self { context, policy, flush: Some(tpm) }
    }
}

impl Drop for LoadedResource<'_> {
    fn drop(&mut self) {
        if let Some(tpm) = self.flush.take() {
            flush(tpm, self.context.handle);
        }
    }
}

/// A session that authorizes use of a resource with the user role.
pub struct AuthSession<'t> {
    pub context: SessionContext,
    flush: Option<&'t dyn TpmConnection>,
}

impl<'t> AuthSession<'t> {
    /// A session owned by the caller, which is not flushed after use.
    pub fn new(context: SessionContext) -> Self {
        Self { context, flush: None }
    }

    pub fn transient(context: SessionContext, tpm: &'t dyn TpmConnection) -> Self {
        Self { context, flush: Some(tpm) }
    }
}

impl Drop for AuthSession<'_> {
    fn drop(&mut self) {
        if let Some(tpm) = self.flush.take() {
            flush(tpm, self.context.handle);
        }
    }
}

/// Provides authorization for resources that don't have a known policy.
pub trait PolicyResourceAuthorizer {
    /// Either set the resource's authorization value, or return a session
    /// that authorizes use of it.
    fn authorize(&mut self, resource: &mut ResourceContext) -> Result<Option<SessionContext>, PolicyError>;
}

/// An authorizer that supplies nothing beyond what a resource context already carries.
#[derive(Debug, Default)]
pub struct NullAuthorizer;

impl PolicyResourceAuthorizer for NullAuthorizer {
    fn authorize(&mut self, _resource: &mut ResourceContext) -> Result<Option<SessionContext>, PolicyError> {
        Ok(None)
    }
}

/// Loads the resources that policy assertions refer to.
pub trait PolicyResourceLoader<'t> {
    /// Find and load the resource with the specified name.
    fn load_name(&mut self, name: &[u8]) -> Result<LoadedResource<'t>, PolicyError>;

    fn load_handle(&mut self, handle: TPM_HANDLE) -> Result<LoadedResource<'t>, PolicyError>;

    /// Load a public key for signature verification.
    fn load_external(&mut self, public: &TPMT_PUBLIC) -> Result<LoadedResource<'t>, PolicyError>;

    /// Obtain authorization for the user role of a resource, for the specified use.
    fn authorize(
        &mut self,
        resource: &mut ResourceContext,
        usage: &PolicySessionUsage,
    ) -> Result<Option<AuthSession<'t>>, PolicyError>;

    /// Policies approved by `key_sign` for the specified policy reference.
    fn load_authorized_policies(&mut self, key_sign: &[u8], policy_ref: &[u8]) -> Result<Vec<Policy>, PolicyError>;
}

/// A context saved with TPM2_ContextSave, and the name of the saved resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedContext {
    pub name: Name,
    pub context: Vec<u8>,
}

/// An object that can be loaded with TPM2_Load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadableObject {
    pub parent: Name,
    pub public: TPMT_PUBLIC,
    pub private: Vec<u8>,
}

/// The resources available to [`TpmPolicyResources`].
#[derive(Debug, Clone, Default)]
pub struct PolicyResources {
    /// Resources that are already loaded.
    pub loaded: Vec<ResourceContext>,
    /// Resources that can be restored with TPM2_ContextLoad.
    pub saved: Vec<SavedContext>,
    /// Objects that can be loaded with TPM2_Load, beneath a parent found by name.
    pub unloaded: Vec<LoadableObject>,
    /// Policies for resources, by name.
    pub policies: BTreeMap<Name, Policy>,
    /// Policies that are approved by signing keys for TPM2_PolicyAuthorize.
    pub authorized_policies: Vec<Policy>,
}

impl PolicyResources {
    pub fn with_loaded(mut self, resource: ResourceContext) -> Self {
        self.loaded.push(resource);
        self
    }

    pub fn with_policy(mut self, name: Name, policy: Policy) -> Self {
        self.policies.insert(name, policy);
        self
    }

    pub fn with_unloaded(mut self, object: LoadableObject) -> Self {
        self.unloaded.push(object);
        self
    }

    pub fn with_authorized_policy(mut self, policy: Policy) -> Self {
        self.authorized_policies.push(policy);
        self
    }
}

/// Loads resources on a TPM.
///
/// Names are searched for among permanent handles and PCRs, then among the
/// supplied loaded resources, saved contexts and loadable objects, and finally
/// among the persistent objects and NV indices on the TPM.
pub struct TpmPolicyResources<'t> {
    tpm: &'t dyn TpmConnection,
    resources: PolicyResources,
    authorizer: Box<dyn PolicyResourceAuthorizer + 't>,
}

impl<'t> TpmPolicyResources<'t> {
    pub fn new(
        tpm: &'t dyn TpmConnection,
        resources: PolicyResources,
        authorizer: Box<dyn PolicyResourceAuthorizer + 't>,
    ) -> Self {
        Self { tpm, resources, authorizer }
    }

    pub fn resources(&self) -> &PolicyResources {
        &self.resources
    }

    fn policy_for(&self, name: &[u8]) -> Option<Policy> {
        self.resources.policies.get(name).cloned()
    }

    fn load_saved(&mut self, saved: &SavedContext) -> Result<LoadedResource<'t>, PolicyError> {
        let handle = self.tpm.context_load(&saved.context)?;
        let resource = match self.tpm.new_resource_context(handle) {
            Ok(resource) => resource,
            Err(e) => {
                flush(self.tpm, handle);
                return Err(e.into());
            }
        };
        if resource.name != saved.name {
            flush(self.tpm, handle);
            return Err(PolicyError::Other("loaded context has the wrong name".to_string()));
        }
        Ok(LoadedResource::transient(resource, self.policy_for(&saved.name), self.tpm))
    }

    fn load_object(&mut self, name: &[u8], object: &LoadableObject) -> Result<LoadedResource<'t>, PolicyError> {
        let mut parent = self
            .load_name(&object.parent)
            .map_err(|e| PolicyError::resource("load", &object.parent, e))?;

        let usage = PolicySessionUsage::new(TPM_CC::Load, vec![parent.context.clone()], Vec::new());
        let session = self
            .authorize(&mut parent.context, &usage)
            .map_err(|e| PolicyError::resource("authorize", &object.parent, e))?;

        let resource = self.tpm.load(
            &parent.context,
            &object.private,
            &object.public,
            session.as_ref().map(|s| &s.context),
        )?;
        let loaded = LoadedResource::transient(resource, self.policy_for(name), self.tpm);

        // Cache the loaded object so that it doesn't need to be loaded beneath its parent again.
        match self.tpm.context_save(loaded.context.handle) {
            Ok(context) => self.resources.saved.push(SavedContext { name: name.to_vec(), context }),
            Err(e) => debug!("cannot save context for loaded object: {}", e),
        }

        Ok(loaded)
    }

    fn find_on_tpm(&mut self, name: &[u8]) -> Result<Option<LoadedResource<'t>>, PolicyError> {
        for first in [PERSISTENT_FIRST, NV_INDEX_FIRST] {
            let handles = self
                .tpm
                .get_capability_handles(TPM_HANDLE::new(first), MAX_CAPABILITY_HANDLES)?;
            for handle in handles {
                let resource = match self.tpm.new_resource_context(handle) {
                    Ok(resource) => resource,
                    Err(TpmError::ResourceUnavailable(_)) => continue,
                    Err(e) => return Err(e.into()),
                };
                if resource.name == name {
                    return Ok(Some(LoadedResource::new(resource, self.policy_for(name))));
                }
            }
        }
        Ok(None)
    }
}

impl<'t> PolicyResourceLoader<'t> for TpmPolicyResources<'t> {
    fn load_name(&mut self, name: &[u8]) -> Result<LoadedResource<'t>, PolicyError> {
        if let Some(handle) = name_handle(name) {
            match handle.get_type() {
                TPM_HT::PERMANENT | TPM_HT::PCR => {
                    return Ok(LoadedResource::new(self.tpm.get_permanent_context(handle)?, self.policy_for(name)))
                }
                _ => return Err(PolicyError::InvalidPolicy(format!("invalid name for {}", handle))),
            }
        }

        if let Some(resource) = self.resources.loaded.iter().find(|r| r.name == name) {
            return Ok(LoadedResource::new(resource.clone(), self.policy_for(name)));
        }

        if let Some(saved) = self.resources.saved.iter().find(|s| s.name == name).cloned() {
            debug!("loading saved context for {}", hex::encode(name));
            return self.load_saved(&saved);
        }

        let unloaded = self
            .resources
            .unloaded
            .iter()
            .find(|o| o.public.get_name().is_ok_and(|n| n == name))
            .cloned();
        if let Some(object) = unloaded {
            debug!("loading object {}", hex::encode(name));
            return self.load_object(name, &object);
        }

        if let Some(resource) = self.find_on_tpm(name)? {
            return Ok(resource);
        }

        Err(PolicyError::ResourceNotFound(name.to_vec()))
    }

    fn load_handle(&mut self, handle: TPM_HANDLE) -> Result<LoadedResource<'t>, PolicyError> {
        let resource = match handle.get_type() {
            TPM_HT::PERMANENT | TPM_HT::PCR => self.tpm.get_permanent_context(handle)?,
            _ => self.tpm.new_resource_context(handle)?,
        };
        let policy = self.policy_for(&resource.name);
        Ok(LoadedResource::new(resource, policy))
    }

    fn load_external(&mut self, public: &TPMT_PUBLIC) -> Result<LoadedResource<'t>, PolicyError> {
        let resource = self
            .tpm
            .load_external(public, TPM_HANDLE::new(TPM_RH::OWNER.get_value()))?;
        Ok(LoadedResource::transient(resource, None, self.tpm))
    }

    fn authorize(
        &mut self,
        resource: &mut ResourceContext,
        usage: &PolicySessionUsage,
    ) -> Result<Option<AuthSession<'t>>, PolicyError> {
        let Some(policy) = self.policy_for(&resource.name) else {
            return Ok(self.authorizer.authorize(resource)?.map(AuthSession::new));
        };

        let mut alg = name_alg(&resource.name);
        if !alg.is_hash() {
            alg = TPM_ALG_ID::SHA256;
        }

        debug!("executing policy for {}", hex::encode(&resource.name));
        let session = AuthSession::transient(self.tpm.start_auth_session(TPM_SE::POLICY, alg)?, self.tpm);
        let params = PolicyExecuteParams::default().with_usage(usage.clone());
        let tpm = self.tpm;
        policy.execute(tpm, &session.context, Some(self), &params)?;
        Ok(Some(session))
    }

    fn load_authorized_policies(&mut self, key_sign: &[u8], policy_ref: &[u8]) -> Result<Vec<Policy>, PolicyError> {
        Ok(self
            .resources
            .authorized_policies
            .iter()
            .filter(|p| {
                p.authorizations.iter().any(|auth| {
                    auth.policy_ref == policy_ref && auth.auth_name().is_ok_and(|n| n == key_sign)
                })
            })
            .cloned()
            .collect())
    }
}

/// A loader for trial runs, which returns resources that only carry the
/// requested name.
#[derive(Debug, Default)]
pub struct MockPolicyResources;

impl<'t> PolicyResourceLoader<'t> for MockPolicyResources {
    fn load_name(&mut self, name: &[u8]) -> Result<LoadedResource<'t>, PolicyError> {
        let handle = name_handle(name).unwrap_or(TPM_HANDLE::new(TPM_RH::NULL.get_value()));
        Ok(LoadedResource::new(ResourceContext::new(handle, name.to_vec()), None))
    }

    fn load_handle(&mut self, handle: TPM_HANDLE) -> Result<LoadedResource<'t>, PolicyError> {
        Ok(LoadedResource::new(ResourceContext::from_handle(handle), None))
    }

    fn load_external(&mut self, public: &TPMT_PUBLIC) -> Result<LoadedResource<'t>, PolicyError> {
        let context = ResourceContext::new(TPM_HANDLE::new(TPM_RH::NULL.get_value()), public.get_name()?);
        Ok(LoadedResource::new(context, None))
    }

    fn authorize(
        &mut self,
        _resource: &mut ResourceContext,
        _usage: &PolicySessionUsage,
    ) -> Result<Option<AuthSession<'t>>, PolicyError> {
        Ok(None)
    }

    fn load_authorized_policies(&mut self, _key_sign: &[u8], _policy_ref: &[u8]) -> Result<Vec<Policy>, PolicyError> {
        Ok(Vec::new())
    }
}

/// The loader used when the caller supplies none. Nothing can be loaded.
#[derive(Debug, Default)]
pub struct NullPolicyResources;

impl<'t> PolicyResourceLoader<'t> for NullPolicyResources {
    fn load_name(&mut self, name: &[u8]) -> Result<LoadedResource<'t>, PolicyError> {
        Err(PolicyError::ResourceNotFound(name.to_vec()))
    }

    fn load_handle(&mut self, handle: TPM_HANDLE) -> Result<LoadedResource<'t>, PolicyError> {
        Err(PolicyError::ResourceNotFound(handle.get_name()))
    }

    fn load_external(&mut self, public: &TPMT_PUBLIC) -> Result<LoadedResource<'t>, PolicyError> {
        Err(PolicyError::ResourceNotFound(public.get_name()?))
    }

    fn authorize(
        &mut self,
        _resource: &mut ResourceContext,
        _usage: &PolicySessionUsage,
    ) -> Result<Option<AuthSession<'t>>, PolicyError> {
        Ok(None)
    }

    fn load_authorized_policies(&mut self, _key_sign: &[u8], _policy_ref: &[u8]) -> Result<Vec<Policy>, PolicyError> {
        Ok(Vec::new())
    }
}
