use crate::error::EmsgError;
use crate::message::{Message, SystemMessageBuilder, GROUP_PREFIX};
use crate::time::now_secs;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupRole {
    Owner,
    Admin,
    Moderator,
    Member,
    Guest,
}

impl GroupRole {
    /// Rank used in permission comparisons; higher outranks lower.
    pub fn level(&self) -> u8 {
        match self {
            GroupRole::Owner => 5,
            GroupRole::Admin => 4,
            GroupRole::Moderator => 3,
            GroupRole::Member => 2,
            GroupRole::Guest => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    SendMessage,
    DeleteMessage,
    AddMember,
    RemoveMember,
    ChangeRole,
    ManageGroup,
    ViewMembers,
    ViewHistory,
    CreateSubgroup,
    DeleteGroup,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Active,
    Inactive,
    Banned,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupMember {
    pub address: String,
    pub role: GroupRole,
    pub joined_at: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub invited_by: String,
    pub status: MemberStatus,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupSettings {
    pub is_public: bool,
    pub require_invite: bool,
    pub allow_guest_messages: bool,
    pub max_members: usize,
    pub message_retention: Duration,
    pub permissions: HashMap<GroupRole, HashSet<Permission>>,
}

impl Default for GroupSettings {
    fn default() -> Self {
        use Permission::*;
        let mut permissions = HashMap::new();
        permissions.insert(
            GroupRole::Owner,
            HashSet::from([
                SendMessage,
                DeleteMessage,
                AddMember,
                RemoveMember,
                ChangeRole,
                ManageGroup,
                ViewMembers,
                ViewHistory,
                CreateSubgroup,
                DeleteGroup,
            ]),
        );
        permissions.insert(
            GroupRole::Admin,
            HashSet::from([
                SendMessage,
                DeleteMessage,
                AddMember,
                RemoveMember,
                ChangeRole,
                ManageGroup,
                ViewMembers,
                ViewHistory,
                CreateSubgroup,
            ]),
        );
        permissions.insert(
            GroupRole::Moderator,
            HashSet::from([SendMessage, DeleteMessage, AddMember, ViewMembers, ViewHistory]),
        );
        permissions.insert(
            GroupRole::Member,
            HashSet::from([SendMessage, ViewMembers, ViewHistory]),
        );
        permissions.insert(GroupRole::Guest, HashSet::from([ViewHistory]));
        Self {
            is_public: false,
            require_invite: true,
            allow_guest_messages: false,
            max_members: 100,
            message_retention: Duration::from_secs(30 * 24 * 60 * 60),
            permissions,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub created_at: i64,
    pub created_by: String,
    pub members: HashMap<String, GroupMember>,
    pub settings: GroupSettings,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Group {
    pub fn has_permission(&self, address: &str, permission: Permission) -> bool {
        let Some(member) = self.members.get(address) else {
            return false;
        };
        self.settings
            .permissions
            .get(&member.role)
            .map(|set| set.contains(&permission))
            .unwrap_or(false)
    }

    pub fn member(&self, address: &str) -> Option<&GroupMember> {
        self.members.get(address)
    }

    pub fn members_by_role(&self, role: GroupRole) -> Vec<GroupMember> {
        self.members
            .values()
            .filter(|m| m.role == role)
            .cloned()
            .collect()
    }

    pub fn to_json(&self) -> Result<Vec<u8>, EmsgError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, EmsgError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Owns all groups. The outer map lock orders group creation and removal;
/// each group's lock serializes its member mutations. Accessors hand out
/// copies, never references into shared state.
#[derive(Clone, Default)]
pub struct GroupManager {
    groups: Arc<RwLock<HashMap<String, Arc<Mutex<Group>>>>>,
}

impl GroupManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_group(
        &self,
        id: &str,
        name: &str,
        created_by: &str,
        settings: Option<GroupSettings>,
    ) -> Result<Group, EmsgError> {
        let mut groups = self.groups.write().await;
        if groups.contains_key(id) {
            return Err(EmsgError::State(format!("group {id} already exists")));
        }
        let now = now_secs();
        let mut members = HashMap::new();
        members.insert(
            created_by.to_string(),
            GroupMember {
                address: created_by.to_string(),
                role: GroupRole::Owner,
                joined_at: now,
                invited_by: String::new(),
                status: MemberStatus::Active,
            },
        );
        let group = Group {
            id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            created_at: now,
            created_by: created_by.to_string(),
            members,
            settings: settings.unwrap_or_default(),
            metadata: Map::new(),
        };
        groups.insert(id.to_string(), Arc::new(Mutex::new(group.clone())));
        Ok(group)
    }

    pub async fn get_group(&self, id: &str) -> Result<Group, EmsgError> {
        let handle = self.handle(id).await?;
        let group = handle.lock().await;
        Ok(group.clone())
    }

    pub async fn delete_group(&self, id: &str, actor: &str) -> Result<(), EmsgError> {
        let mut groups = self.groups.write().await;
        let handle = groups
            .get(id)
            .ok_or_else(|| EmsgError::NotFound(format!("group {id}")))?;
        {
            let group = handle.lock().await;
            if !group.has_permission(actor, Permission::DeleteGroup) {
                return Err(EmsgError::PermissionDenied(
                    "delete_group requires owner rights".to_string(),
                ));
            }
        }
        groups.remove(id);
        Ok(())
    }

    pub async fn list_groups(&self) -> Vec<Group> {
        let handles: Vec<Arc<Mutex<Group>>> =
            self.groups.read().await.values().cloned().collect();
        let mut groups = Vec::with_capacity(handles.len());
        for handle in handles {
            groups.push(handle.lock().await.clone());
        }
        groups
    }

    pub async fn add_member(
        &self,
        group_id: &str,
        address: &str,
        invited_by: &str,
        role: GroupRole,
    ) -> Result<(), EmsgError> {
        let handle = self.handle(group_id).await?;
        let mut group = handle.lock().await;
        if !group.has_permission(invited_by, Permission::AddMember) {
            return Err(EmsgError::PermissionDenied(
                "add_member".to_string(),
            ));
        }
        if role == GroupRole::Owner {
            return Err(EmsgError::State(
                "group already has an owner".to_string(),
            ));
        }
        if group.members.contains_key(address) {
            return Err(EmsgError::State(format!(
                "member {address} already in group"
            )));
        }
        if group.members.len() >= group.settings.max_members {
            return Err(EmsgError::State(
                "group has reached maximum member count".to_string(),
            ));
        }
        group.members.insert(
            address.to_string(),
            GroupMember {
                address: address.to_string(),
                role,
                joined_at: now_secs(),
                invited_by: invited_by.to_string(),
                status: MemberStatus::Active,
            },
        );
        Ok(())
    }

    pub async fn remove_member(
        &self,
        group_id: &str,
        address: &str,
        actor: &str,
    ) -> Result<(), EmsgError> {
        let handle = self.handle(group_id).await?;
        let mut group = handle.lock().await;
        if !group.has_permission(actor, Permission::RemoveMember) {
            return Err(EmsgError::PermissionDenied("remove_member".to_string()));
        }
        let target = group
            .members
            .get(address)
            .ok_or_else(|| EmsgError::NotFound(format!("member {address}")))?;
        if target.role == GroupRole::Owner {
            return Err(EmsgError::PermissionDenied(
                "cannot remove group owner".to_string(),
            ));
        }
        let actor_level = group
            .members
            .get(actor)
            .map(|m| m.role.level())
            .unwrap_or(0);
        if actor_level <= target.role.level() {
            return Err(EmsgError::PermissionDenied(format!(
                "cannot remove member with role level {}",
                target.role.level()
            )));
        }
        group.members.remove(address);
        Ok(())
    }

    pub async fn change_role(
        &self,
        group_id: &str,
        address: &str,
        actor: &str,
        new_role: GroupRole,
    ) -> Result<(), EmsgError> {
        let handle = self.handle(group_id).await?;
        let mut group = handle.lock().await;
        if !group.has_permission(actor, Permission::ChangeRole) {
            return Err(EmsgError::PermissionDenied("change_role".to_string()));
        }
        let target_role = group
            .members
            .get(address)
            .map(|m| m.role)
            .ok_or_else(|| EmsgError::NotFound(format!("member {address}")))?;
        if target_role == GroupRole::Owner || new_role == GroupRole::Owner {
            return Err(EmsgError::PermissionDenied(
                "owner role cannot change hands".to_string(),
            ));
        }
        let actor_level = group
            .members
            .get(actor)
            .map(|m| m.role.level())
            .unwrap_or(0);
        if actor_level <= target_role.level() || actor_level <= new_role.level() {
            return Err(EmsgError::PermissionDenied(
                "role change requires a strictly higher role".to_string(),
            ));
        }
        if let Some(member) = group.members.get_mut(address) {
            member.role = new_role;
        }
        Ok(())
    }

    pub async fn has_permission(
        &self,
        group_id: &str,
        address: &str,
        permission: Permission,
    ) -> bool {
        match self.handle(group_id).await {
            Ok(handle) => handle.lock().await.has_permission(address, permission),
            Err(_) => false,
        }
    }

    pub async fn get_member(
        &self,
        group_id: &str,
        address: &str,
    ) -> Result<GroupMember, EmsgError> {
        let handle = self.handle(group_id).await?;
        let group = handle.lock().await;
        group
            .members
            .get(address)
            .cloned()
            .ok_or_else(|| EmsgError::NotFound(format!("member {address}")))
    }

    pub async fn get_members(&self, group_id: &str) -> Result<Vec<GroupMember>, EmsgError> {
        let handle = self.handle(group_id).await?;
        let group = handle.lock().await;
        Ok(group.members.values().cloned().collect())
    }

    async fn handle(&self, id: &str) -> Result<Arc<Mutex<Group>>, EmsgError> {
        self.groups
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EmsgError::NotFound(format!("group {id}")))
    }
}

/// Builds a signable `group:<action>` control message addressed to the group,
/// sent on behalf of the synthetic `system#<domain>` sender.
pub fn create_group_message(
    group_id: &str,
    action: &str,
    actor: &str,
    data: Map<String, Value>,
) -> Result<Message, EmsgError> {
    let kind = format!("{GROUP_PREFIX}{action}");
    let mut builder = SystemMessageBuilder::new()
        .kind(&kind)
        .actor(actor)
        .group_id(group_id);
    for (key, value) in data {
        builder = builder.metadata(&key, value);
    }
    let from = format!("system#{}", group_domain(group_id));
    builder.build(&from, vec![group_id.to_string()])
}

fn group_domain(group_id: &str) -> &str {
    group_id.split_once('#').map(|(_, d)| d).unwrap_or("localhost")
}
